use std::fmt;
use std::sync::Arc;

use crate::api::{
    Book, BookByTitleRequest, BookByTitleResponse, BookListRequest, BookListResponse, BookPatch,
    CreateBook, UpdateBook,
};
use crate::books_repository::{BookRepositoryError, UpdatePatchRequest};
use crate::storage::Storage;

/// Status reported to the caller of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    NotFound,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::NotFound => "NOT_FOUND",
            Code::Unavailable => "UNAVAILABLE",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: Code,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn no_rows_affected() -> Self {
        Self::new(Code::InvalidArgument, "no rows were affected")
    }
}

impl From<BookRepositoryError> for ServiceError {
    fn from(err: BookRepositoryError) -> Self {
        let code = match &err {
            BookRepositoryError::NotFound(_) => Code::NotFound,
            BookRepositoryError::ConstraintViolation(_)
            | BookRepositoryError::InvalidArgument(_) => Code::InvalidArgument,
            BookRepositoryError::ConnectionError(_) => Code::Unavailable,
            BookRepositoryError::Timeout => Code::DeadlineExceeded,
            BookRepositoryError::Undefined(_) | BookRepositoryError::DatabaseFailure(_) => {
                Code::Internal
            }
        };
        Self::new(code, err.to_string())
    }
}

/// Implements the book service methods on top of the storage
#[derive(Clone)]
pub struct BookService {
    storage: Arc<dyn Storage>,
}

impl BookService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Creates the book and returns it as stored
    pub async fn create(&self, request: CreateBook) -> Result<Book, ServiceError> {
        tracing::info!("Create book {:?}", request);

        let book_id = self.storage.book().create(&request).await.map_err(|err| {
            tracing::error!("Create book failed {}", err);
            ServiceError::from(err)
        })?;

        self.read_back(&book_id).await
    }

    pub async fn get_by_id(&self, book_id: &str) -> Result<Book, ServiceError> {
        tracing::info!("Get book {}", book_id);

        self.storage.book().get_by_pkey(book_id).await.map_err(|err| {
            tracing::error!("Get book {} failed {}", book_id, err);
            err.into()
        })
    }

    pub async fn get_book_by_title(
        &self,
        request: BookByTitleRequest,
    ) -> Result<BookByTitleResponse, ServiceError> {
        tracing::info!("Get book by title {:?}", request);

        let book = self
            .storage
            .book()
            .get_by_title(&request.title)
            .await
            .map_err(|err| {
                tracing::error!("Get book by title failed {}", err);
                ServiceError::from(err)
            })?;
        Ok(BookByTitleResponse { book })
    }

    pub async fn get_list(
        &self,
        request: BookListRequest,
    ) -> Result<BookListResponse, ServiceError> {
        tracing::info!("Get books {:?}", request);

        self.storage.book().get_all(&request).await.map_err(|err| {
            tracing::error!("Get books failed {}", err);
            err.into()
        })
    }

    /// Replaces the book fields and returns the book as stored
    pub async fn update(&self, book_id: &str, request: UpdateBook) -> Result<Book, ServiceError> {
        tracing::info!("Update book {} {:?}", book_id, request);

        let rows_affected = self
            .storage
            .book()
            .update(book_id, &request)
            .await
            .map_err(|err| {
                tracing::error!("Update book {} failed {}", book_id, err);
                ServiceError::from(err)
            })?;
        if rows_affected == 0 {
            return Err(ServiceError::no_rows_affected());
        }

        self.read_back(book_id).await
    }

    /// Changes only the fields present in the patch and returns the book as stored
    pub async fn update_patch(
        &self,
        book_id: &str,
        fields: BookPatch,
    ) -> Result<Book, ServiceError> {
        tracing::info!("Patch book {} {:?}", book_id, fields);

        let request = UpdatePatchRequest {
            id: book_id.to_string(),
            fields,
        };
        let rows_affected = self
            .storage
            .book()
            .update_patch(&request)
            .await
            .map_err(|err| {
                tracing::error!("Patch book {} failed {}", book_id, err);
                ServiceError::from(err)
            })?;
        if rows_affected == 0 {
            return Err(ServiceError::no_rows_affected());
        }

        self.read_back(book_id).await
    }

    pub async fn delete(&self, book_id: &str) -> Result<(), ServiceError> {
        tracing::info!("Delete book {}", book_id);

        self.storage.book().delete(book_id).await.map_err(|err| {
            tracing::error!("Delete book {} failed {}", book_id, err);
            err.into()
        })
    }

    // Separate statement, may observe changes made after the write
    async fn read_back(&self, book_id: &str) -> Result<Book, ServiceError> {
        self.storage.book().get_by_pkey(book_id).await.map_err(|err| {
            tracing::error!("Reading back book {} failed {}", book_id, err);
            err.into()
        })
    }
}

#[cfg(test)]
mod book_service_tests {
    use crate::api::BookFieldValue;
    use crate::query_params::QueryParamsError;
    use crate::storage::InMemoryStorage;

    use super::*;

    fn service() -> BookService {
        BookService::new(Arc::new(InMemoryStorage::default()))
    }

    fn orwell_1984() -> CreateBook {
        CreateBook {
            isbn: "978-0".to_string(),
            title: "1984".to_string(),
            author: "Orwell".to_string(),
            pages: 328,
            status: 1,
            ..CreateBook::default()
        }
    }

    #[tokio::test]
    async fn test_create_returns_stored_book() {
        let service = service();
        let book = service.create(orwell_1984()).await.expect("Failed to create");

        assert!(!book.id.is_empty());
        assert_eq!(book.title, "1984");
        assert_eq!(book.author, "Orwell");
        assert_eq!(book.pages, 328);
        assert_eq!(book.status, 1);
        assert_eq!(book.created_at, book.updated_at);
        assert_eq!(service.get_by_id(&book.id).await.unwrap(), book);
    }

    #[tokio::test]
    async fn test_create_with_invalid_data_is_invalid_argument() {
        let result = service()
            .create(CreateBook {
                status: -1,
                ..orwell_1984()
            })
            .await;
        assert_eq!(result.unwrap_err().code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_get_missing_book_is_not_found() {
        let result = service().get_by_id("missing").await;
        assert_eq!(result.unwrap_err().code, Code::NotFound);
    }

    #[tokio::test]
    async fn test_get_by_title_without_match_is_not_an_error() {
        let service = service();
        let response = service
            .get_book_by_title(BookByTitleRequest {
                title: "Dune".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.book, None);

        let created = service.create(orwell_1984()).await.unwrap();
        let response = service
            .get_book_by_title(BookByTitleRequest {
                title: "198".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.book, Some(created));
    }

    #[tokio::test]
    async fn test_update_returns_updated_book() {
        let service = service();
        let created = service.create(orwell_1984()).await.unwrap();

        let updated = service
            .update(
                &created.id,
                UpdateBook {
                    title: "Animal Farm".to_string(),
                    author: "George Orwell".to_string(),
                    pages: 112,
                    ..UpdateBook::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Animal Farm");
        assert_eq!(updated.author, "George Orwell");
        assert_eq!(updated.status, 0);
        assert_eq!(updated.isbn, created.isbn);
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn test_update_of_missing_book_affects_no_rows() {
        let result = service().update("missing", UpdateBook::default()).await;
        assert_eq!(result, Err(ServiceError::no_rows_affected()));
    }

    #[tokio::test]
    async fn test_update_patch() {
        let service = service();
        let created = service.create(orwell_1984()).await.unwrap();

        let empty = service.update_patch(&created.id, BookPatch::new()).await;
        assert_eq!(empty.unwrap_err().code, Code::InvalidArgument);

        let patched = service
            .update_patch(
                &created.id,
                BookPatch::new().with(BookFieldValue::Cover("cover.png".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(
            patched,
            Book {
                cover: "cover.png".to_string(),
                updated_at: patched.updated_at,
                ..created
            }
        );

        let missing = service
            .update_patch(
                "missing",
                BookPatch::new().with(BookFieldValue::Pages(1)),
            )
            .await;
        assert_eq!(missing, Err(ServiceError::no_rows_affected()));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let service = service();
        let first = service.create(orwell_1984()).await.unwrap();
        let second = service.create(orwell_1984()).await.unwrap();

        service.delete(&first.id).await.unwrap();
        service.delete(&first.id).await.unwrap();

        let list = service.get_list(BookListRequest::default()).await.unwrap();
        assert_eq!(list.count, 1);
        assert_eq!(list.books, vec![second]);
    }

    #[test]
    fn test_repository_errors_map_to_codes() {
        let cases = [
            (BookRepositoryError::NotFound("x".to_string()), Code::NotFound),
            (
                BookRepositoryError::ConstraintViolation("x".to_string()),
                Code::InvalidArgument,
            ),
            (
                BookRepositoryError::InvalidArgument("x".to_string()),
                Code::InvalidArgument,
            ),
            (
                BookRepositoryError::ConnectionError("x".to_string()),
                Code::Unavailable,
            ),
            (BookRepositoryError::Timeout, Code::DeadlineExceeded),
            (
                BookRepositoryError::Undefined(QueryParamsError::Undefined("id".to_string())),
                Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(ServiceError::from(err).code, code);
        }
    }
}
