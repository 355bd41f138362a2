pub use in_memory_books_repository::InMemoryBookRepository;
pub use postgres_books_repository::PostgresBooksRepository;

use tokio_postgres::error::SqlState;

use crate::api::{Book, BookId, BookListRequest, BookListResponse, BookPatch, CreateBook, UpdateBook};
use crate::query_params::QueryParamsError;

mod in_memory_books_repository;
mod postgres_books_repository;

#[derive(thiserror::Error, Debug)]
pub enum BookRepositoryError {
    #[error("Book {0} not found")]
    NotFound(BookId),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query timed out or was cancelled")]
    Timeout,

    #[error("{0}")]
    Undefined(#[from] QueryParamsError),

    #[error("Database failure {0}")]
    DatabaseFailure(tokio_postgres::Error),
}

impl From<tokio_postgres::Error> for BookRepositoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        let Some(db_error) = err.as_db_error() else {
            return if err.is_closed() {
                BookRepositoryError::ConnectionError(err.to_string())
            } else {
                BookRepositoryError::DatabaseFailure(err)
            };
        };
        let code = db_error.code();
        if code == &SqlState::QUERY_CANCELED {
            BookRepositoryError::Timeout
        } else if code.code().starts_with("23") {
            // integrity constraint violation class
            BookRepositoryError::ConstraintViolation(db_error.message().to_string())
        } else if code.code().starts_with("22") {
            // data exception class
            BookRepositoryError::InvalidArgument(db_error.message().to_string())
        } else {
            BookRepositoryError::DatabaseFailure(err)
        }
    }
}

/// Partial update of a single book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePatchRequest {
    pub id: BookId,
    pub fields: BookPatch,
}

#[async_trait::async_trait]
pub trait BookRepository: Send + Sync {
    /// Adds book to repository, returns an id generated for the book
    async fn create(&self, book: &CreateBook) -> Result<BookId, BookRepositoryError>;

    /// Retrieves the book with exactly this id
    async fn get_by_pkey(&self, book_id: &str) -> Result<Book, BookRepositoryError>;

    /// Retrieves any one book whose title contains `title`, ignoring case.
    /// None means that no book matched.
    async fn get_by_title(&self, title: &str) -> Result<Option<Book>, BookRepositoryError>;

    /// Lists books matching the filter, newest first, with the total number of matches.
    /// The total is counted by the same statement as the page, a separate count
    /// statement runs only when the page is empty and the offset is positive.
    async fn get_all(
        &self,
        filter: &BookListRequest,
    ) -> Result<BookListResponse, BookRepositoryError>;

    /// Replaces all updatable fields, returns number of updated rows
    async fn update(&self, book_id: &str, book: &UpdateBook) -> Result<u64, BookRepositoryError>;

    /// Replaces only the fields present in the patch, returns number of updated rows
    async fn update_patch(&self, request: &UpdatePatchRequest) -> Result<u64, BookRepositoryError>;

    /// Removes the book. Removing a book that does not exist is not an error.
    async fn delete(&self, book_id: &str) -> Result<(), BookRepositoryError>;
}

/// Resolved page window of a list request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageWindow {
    /// None means no limit
    pub limit: Option<i64>,
    pub offset: i64,
}

impl PageWindow {
    /// `default_limit` is used when the request has no positive limit, 0 disables it
    pub fn resolve(
        filter: &BookListRequest,
        default_limit: i64,
    ) -> Result<Self, BookRepositoryError> {
        let limit = filter.limit.unwrap_or_default();
        let offset = filter.offset.unwrap_or_default();
        if limit < 0 || offset < 0 {
            return Err(BookRepositoryError::InvalidArgument(
                "limit and offset must not be negative".to_string(),
            ));
        }
        let limit = if limit > 0 { limit } else { default_limit };
        Ok(Self {
            limit: (limit > 0).then_some(limit),
            offset,
        })
    }
}

/// Search text of the filter, None when it is empty
pub(crate) fn search_term(filter: &BookListRequest) -> Option<&str> {
    filter.search.as_deref().filter(|search| !search.is_empty())
}
