use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type BookId = String;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
/// Book as stored by the service, including server assigned fields
pub struct Book {
    pub id: BookId,
    pub isbn: String,
    pub title: String,
    pub cover: String,
    pub author: String,
    pub published: Option<DateTime<Utc>>,
    pub pages: i32,
    pub status: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
/// Fields provided by the caller when a book is created
pub struct CreateBook {
    pub isbn: String,
    pub title: String,
    #[serde(default)]
    pub cover: String,
    pub author: String,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: i32,
    #[serde(default)]
    pub status: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
/// Full replacement of the updatable fields. Isbn is not part of this set.
pub struct UpdateBook {
    pub title: String,
    #[serde(default)]
    pub cover: String,
    pub author: String,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: i32,
    #[serde(default)]
    pub status: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(default)]
/// Filter and page window for listing books
pub struct BookListRequest {
    /// Case insensitive substring matched against title or author
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookListResponse {
    pub books: Vec<Book>,
    /// Number of books matching the filter, regardless of the page window
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookByTitleRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
/// `book` is `None` when no title matched
pub struct BookByTitleResponse {
    pub book: Option<Book>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Columns of a book that can be changed with a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BookField {
    Isbn,
    Title,
    Cover,
    Author,
    Published,
    Pages,
    Status,
}

impl BookField {
    pub const ALL: [BookField; 7] = [
        BookField::Isbn,
        BookField::Title,
        BookField::Cover,
        BookField::Author,
        BookField::Published,
        BookField::Pages,
        BookField::Status,
    ];

    /// Name of the field on the wire, which is also its column name
    pub fn name(self) -> &'static str {
        match self {
            BookField::Isbn => "isbn",
            BookField::Title => "title",
            BookField::Cover => "cover",
            BookField::Author => "author",
            BookField::Published => "published",
            BookField::Pages => "pages",
            BookField::Status => "status",
        }
    }
}

impl fmt::Display for BookField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BookField {
    type Err = BookPatchError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        BookField::ALL
            .into_iter()
            .find(|field| field.name() == name)
            .ok_or_else(|| BookPatchError::UnknownField(name.to_string()))
    }
}

/// New value for a single patchable field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookFieldValue {
    Isbn(String),
    Title(String),
    Cover(String),
    Author(String),
    Published(Option<DateTime<Utc>>),
    Pages(i32),
    Status(i32),
}

impl BookFieldValue {
    pub fn field(&self) -> BookField {
        match self {
            BookFieldValue::Isbn(_) => BookField::Isbn,
            BookFieldValue::Title(_) => BookField::Title,
            BookFieldValue::Cover(_) => BookField::Cover,
            BookFieldValue::Author(_) => BookField::Author,
            BookFieldValue::Published(_) => BookField::Published,
            BookFieldValue::Pages(_) => BookField::Pages,
            BookFieldValue::Status(_) => BookField::Status,
        }
    }

    /// Checks a loosely typed json value against the type of the field
    pub fn parse(field: BookField, value: Value) -> Result<Self, BookPatchError> {
        let invalid = |reason: &str| BookPatchError::InvalidValue {
            field,
            reason: reason.to_string(),
        };
        match field {
            BookField::Isbn | BookField::Title | BookField::Cover | BookField::Author => {
                let Value::String(text) = value else {
                    return Err(invalid("expected a string"));
                };
                Ok(match field {
                    BookField::Isbn => BookFieldValue::Isbn(text),
                    BookField::Title => BookFieldValue::Title(text),
                    BookField::Cover => BookFieldValue::Cover(text),
                    _ => BookFieldValue::Author(text),
                })
            }
            BookField::Published => serde_json::from_value(value)
                .map(BookFieldValue::Published)
                .map_err(|_| invalid("expected an RFC 3339 timestamp or null")),
            BookField::Pages | BookField::Status => {
                let number = value
                    .as_i64()
                    .and_then(|number| i32::try_from(number).ok())
                    .ok_or_else(|| invalid("expected a 32 bit integer"))?;
                Ok(if field == BookField::Pages {
                    BookFieldValue::Pages(number)
                } else {
                    BookFieldValue::Status(number)
                })
            }
        }
    }

    fn to_json(&self) -> Value {
        match self {
            BookFieldValue::Isbn(text)
            | BookFieldValue::Title(text)
            | BookFieldValue::Cover(text)
            | BookFieldValue::Author(text) => Value::String(text.clone()),
            BookFieldValue::Published(published) => {
                serde_json::to_value(published).unwrap_or(Value::Null)
            }
            BookFieldValue::Pages(number) | BookFieldValue::Status(number) => {
                Value::from(*number)
            }
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BookPatchError {
    #[error("Field {0} can not be patched")]
    UnknownField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: BookField, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
/// Partial update of a book. Serialized as a json object keyed by field name,
/// only the fields present in the object are changed.
pub struct BookPatch {
    fields: BTreeMap<BookField, BookFieldValue>,
}

impl BookPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value, replacing an earlier value for the same field
    pub fn with(mut self, value: BookFieldValue) -> Self {
        self.set(value);
        self
    }

    pub fn set(&mut self, value: BookFieldValue) {
        self.fields.insert(value.field(), value);
    }

    pub fn get(&self, field: BookField) -> Option<&BookFieldValue> {
        self.fields.get(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &BookFieldValue> {
        self.fields.values()
    }
}

impl TryFrom<Map<String, Value>> for BookPatch {
    type Error = BookPatchError;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut patch = BookPatch::new();
        for (name, value) in map {
            let field: BookField = name.parse()?;
            patch.set(BookFieldValue::parse(field, value)?);
        }
        Ok(patch)
    }
}

impl From<BookPatch> for Map<String, Value> {
    fn from(patch: BookPatch) -> Self {
        patch
            .fields
            .into_iter()
            .map(|(field, value)| (field.name().to_string(), value.to_json()))
            .collect()
    }
}

// Documented as a free form object
impl paperclip::v2::schema::Apiv2Schema for BookPatch {}
impl paperclip::actix::OperationModifier for BookPatch {}
