use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};

use crate::api::{
    Book, BookFieldValue, BookId, BookListRequest, BookListResponse, CreateBook, UpdateBook,
};
use crate::books_repository::{
    search_term, BookRepository, BookRepositoryError, PageWindow, UpdatePatchRequest,
};

struct StoredBook {
    sequence: u64,
    book: Book,
}

/// Book repository kept in process memory, used when no database is configured
pub struct InMemoryBookRepository {
    book_sequence_generator: AtomicU64,
    books: parking_lot::RwLock<HashMap<BookId, StoredBook>>,
    default_page_limit: i64,
}

impl Default for InMemoryBookRepository {
    fn default() -> Self {
        Self::new(0)
    }
}

impl InMemoryBookRepository {
    pub fn new(default_page_limit: i64) -> Self {
        Self {
            book_sequence_generator: Default::default(),
            books: Default::default(),
            default_page_limit,
        }
    }
}

fn check_constraints(book: &Book) -> Result<(), BookRepositoryError> {
    if book.pages < 0 {
        return Err(BookRepositoryError::ConstraintViolation(
            "pages must not be negative".to_string(),
        ));
    }
    if book.status < 0 {
        return Err(BookRepositoryError::ConstraintViolation(
            "status must not be negative".to_string(),
        ));
    }
    Ok(())
}

// Strictly after the previous update even if the clock did not move
fn next_update_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + Duration::microseconds(1))
}

fn contains_ignore_case(text: &str, lowercase_needle: &str) -> bool {
    text.to_lowercase().contains(lowercase_needle)
}

#[async_trait::async_trait]
impl BookRepository for InMemoryBookRepository {
    async fn create(&self, book: &CreateBook) -> Result<BookId, BookRepositoryError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let book = Book {
            id: id.clone(),
            isbn: book.isbn.clone(),
            title: book.title.clone(),
            cover: book.cover.clone(),
            author: book.author.clone(),
            published: book.published,
            pages: book.pages,
            status: book.status,
            created_at: now,
            updated_at: now,
        };
        check_constraints(&book)?;

        let sequence = self.book_sequence_generator.fetch_add(1, Ordering::Relaxed);
        self.books
            .write()
            .insert(id.clone(), StoredBook { sequence, book });
        Ok(id)
    }

    async fn get_by_pkey(&self, book_id: &str) -> Result<Book, BookRepositoryError> {
        self.books
            .read()
            .get(book_id)
            .map(|stored| stored.book.clone())
            .ok_or_else(|| BookRepositoryError::NotFound(book_id.to_string()))
    }

    async fn get_by_title(&self, title: &str) -> Result<Option<Book>, BookRepositoryError> {
        let needle = title.to_lowercase();
        Ok(self
            .books
            .read()
            .values()
            .filter(|stored| contains_ignore_case(&stored.book.title, &needle))
            .min_by_key(|stored| stored.sequence)
            .map(|stored| stored.book.clone()))
    }

    async fn get_all(
        &self,
        filter: &BookListRequest,
    ) -> Result<BookListResponse, BookRepositoryError> {
        let window = PageWindow::resolve(filter, self.default_page_limit)?;
        let needle = search_term(filter).map(str::to_lowercase);

        let books = self.books.read();
        let mut matching: Vec<&StoredBook> = books
            .values()
            .filter(|stored| match &needle {
                Some(needle) => {
                    contains_ignore_case(&stored.book.title, needle)
                        || contains_ignore_case(&stored.book.author, needle)
                }
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| {
            b.book
                .created_at
                .cmp(&a.book.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });

        let count = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(window.offset as usize)
            .take(window.limit.map_or(usize::MAX, |limit| limit as usize))
            .map(|stored| stored.book.clone())
            .collect();

        Ok(BookListResponse { books: page, count })
    }

    async fn update(&self, book_id: &str, update: &UpdateBook) -> Result<u64, BookRepositoryError> {
        let mut locked_books = self.books.write();
        let Some(stored) = locked_books.get_mut(book_id) else {
            return Ok(0);
        };

        let updated = Book {
            title: update.title.clone(),
            cover: update.cover.clone(),
            author: update.author.clone(),
            published: update.published,
            pages: update.pages,
            status: update.status,
            updated_at: next_update_time(stored.book.updated_at),
            ..stored.book.clone()
        };
        check_constraints(&updated)?;
        stored.book = updated;
        Ok(1)
    }

    async fn update_patch(&self, request: &UpdatePatchRequest) -> Result<u64, BookRepositoryError> {
        if request.fields.is_empty() {
            return Err(BookRepositoryError::InvalidArgument(
                "no updates provided".to_string(),
            ));
        }

        let mut locked_books = self.books.write();
        let Some(stored) = locked_books.get_mut(&request.id) else {
            return Ok(0);
        };

        let mut updated = stored.book.clone();
        for value in request.fields.values() {
            match value.clone() {
                BookFieldValue::Isbn(isbn) => updated.isbn = isbn,
                BookFieldValue::Title(title) => updated.title = title,
                BookFieldValue::Cover(cover) => updated.cover = cover,
                BookFieldValue::Author(author) => updated.author = author,
                BookFieldValue::Published(published) => updated.published = published,
                BookFieldValue::Pages(pages) => updated.pages = pages,
                BookFieldValue::Status(status) => updated.status = status,
            }
        }
        updated.updated_at = next_update_time(stored.book.updated_at);
        check_constraints(&updated)?;
        stored.book = updated;
        Ok(1)
    }

    async fn delete(&self, book_id: &str) -> Result<(), BookRepositoryError> {
        self.books.write().remove(book_id);
        Ok(())
    }
}
