use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use deadpool_postgres::{ClientWrapper, Object, Pool};
use tokio_postgres::{NoTls, Row};

use crate::api::{
    Book, BookFieldValue, BookId, BookListRequest, BookListResponse, CreateBook, UpdateBook,
};
use crate::books_repository::{
    search_term, BookRepository, BookRepositoryError, PageWindow, UpdatePatchRequest,
};
use crate::query_params::{replace_query_params, QueryParams, SqlValue};

const BOOK_COLUMNS: &str = r#""id", "isbn", "title", "cover", "author", "published", "pages", "status", "created_at", "updated_at""#;

pub struct PostgresBooksRepository {
    pool: Pool,
    query_timeout: Duration,
    default_page_limit: i64,
}

impl PostgresBooksRepository {
    pub fn new(pool: Pool, query_timeout: Duration, default_page_limit: i64) -> Self {
        Self {
            pool,
            query_timeout,
            default_page_limit,
        }
    }

    /// Creates the book table when it does not exist yet
    pub async fn create_schema(&self) -> anyhow::Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get postgres connection")?;
        client
            .batch_execute(
                r#"
        CREATE TABLE IF NOT EXISTS "book" (
            "id"            TEXT PRIMARY KEY,
            "isbn"          TEXT NOT NULL,
            "title"         TEXT NOT NULL,
            "cover"         TEXT NOT NULL DEFAULT '',
            "author"        TEXT NOT NULL,
            "published"     TIMESTAMPTZ,
            "pages"         INTEGER NOT NULL DEFAULT 0 CHECK ("pages" >= 0),
            "status"        INTEGER NOT NULL DEFAULT 0 CHECK ("status" >= 0),
            "created_at"    TIMESTAMPTZ NOT NULL,
            "updated_at"    TIMESTAMPTZ NOT NULL
            )
        "#,
            )
            .await
            .context("Failed to setup book table")?;
        Ok(())
    }

    async fn connection(&self) -> Result<BookConnection, BookRepositoryError> {
        let object = self
            .pool
            .get()
            .await
            .map_err(|err| BookRepositoryError::ConnectionError(err.to_string()))?;
        Ok(BookConnection {
            object: Some(object),
            query_in_flight: AtomicBool::new(false),
        })
    }

    /// Awaits a query issued on `connection`. A query that exceeds the query
    /// timeout, or whose future is dropped, stays marked as in flight and the
    /// connection is cancelled and discarded instead of going back to the pool.
    async fn run<T>(
        &self,
        connection: &BookConnection,
        query: impl Future<Output = Result<T, tokio_postgres::Error>>,
    ) -> Result<T, BookRepositoryError> {
        connection.query_in_flight.store(true, Ordering::SeqCst);
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => {
                connection.query_in_flight.store(false, Ordering::SeqCst);
                Ok(result?)
            }
            Err(_) => {
                tracing::warn!(
                    "Book query exceeded timeout of {:?}, cancelling",
                    self.query_timeout
                );
                Err(BookRepositoryError::Timeout)
            }
        }
    }
}

/// Pooled connection used by a single repository operation
struct BookConnection {
    object: Option<Object>,
    query_in_flight: AtomicBool,
}

impl BookConnection {
    fn client(&self) -> Result<&ClientWrapper, BookRepositoryError> {
        self.object
            .as_deref()
            .ok_or_else(|| BookRepositoryError::ConnectionError("connection released".to_string()))
    }
}

impl Drop for BookConnection {
    fn drop(&mut self) {
        if !*self.query_in_flight.get_mut() {
            return;
        }
        let Some(object) = self.object.take() else {
            return;
        };
        // Detached so no other operation can run on the backend the cancel is aimed at
        let client = Object::take(object);
        let token = client.cancel_token();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = token.cancel_query(NoTls).await {
                    tracing::error!("Failed to cancel book query {}", err);
                }
                drop(client);
            });
        }
    }
}

fn book_from_row(row: &Row) -> Result<Book, tokio_postgres::Error> {
    Ok(Book {
        id: row.try_get("id")?,
        isbn: row.try_get("isbn")?,
        title: row.try_get("title")?,
        cover: row.try_get("cover")?,
        author: row.try_get("author")?,
        published: row.try_get("published")?,
        pages: row.try_get("pages")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// ILIKE pattern matching `text` anywhere, with wildcards in `text` taken literally
fn contains_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn field_value(value: &BookFieldValue) -> SqlValue {
    match value {
        BookFieldValue::Isbn(text)
        | BookFieldValue::Title(text)
        | BookFieldValue::Cover(text)
        | BookFieldValue::Author(text) => SqlValue::from(text.as_str()),
        BookFieldValue::Published(published) => SqlValue::from(*published),
        BookFieldValue::Pages(number) | BookFieldValue::Status(number) => SqlValue::from(*number),
    }
}

#[async_trait::async_trait]
impl BookRepository for PostgresBooksRepository {
    async fn create(&self, book: &CreateBook) -> Result<BookId, BookRepositoryError> {
        let id = uuid::Uuid::new_v4().to_string();
        let connection = self.connection().await?;
        let client = connection.client()?;

        self.run(&connection, async {
            let stmt = client
                .prepare_cached(
                    r#"
                INSERT INTO "book" (
                    "id", "isbn", "title", "cover", "author", "published",
                    "pages", "status", "created_at", "updated_at"
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
                "#,
                )
                .await?;
            client
                .execute(
                    &stmt,
                    &[
                        &id,
                        &book.isbn,
                        &book.title,
                        &book.cover,
                        &book.author,
                        &book.published,
                        &book.pages,
                        &book.status,
                    ],
                )
                .await
        })
        .await?;

        Ok(id)
    }

    async fn get_by_pkey(&self, book_id: &str) -> Result<Book, BookRepositoryError> {
        let connection = self.connection().await?;
        let client = connection.client()?;
        let row = self
            .run(&connection, async {
                let stmt = client
                    .prepare_cached(&format!(
                        r#"SELECT {BOOK_COLUMNS} FROM "book" WHERE "id" = $1"#
                    ))
                    .await?;
                client.query_opt(&stmt, &[&book_id]).await
            })
            .await?
            .ok_or_else(|| BookRepositoryError::NotFound(book_id.to_string()))?;

        Ok(book_from_row(&row)?)
    }

    async fn get_by_title(&self, title: &str) -> Result<Option<Book>, BookRepositoryError> {
        let pattern = contains_pattern(title);
        let connection = self.connection().await?;
        let client = connection.client()?;
        let row = self
            .run(&connection, async {
                let stmt = client
                    .prepare_cached(&format!(
                        r#"SELECT {BOOK_COLUMNS} FROM "book" WHERE "title" ILIKE $1 LIMIT 1"#
                    ))
                    .await?;
                client.query_opt(&stmt, &[&pattern]).await
            })
            .await?;

        Ok(row.as_ref().map(book_from_row).transpose()?)
    }

    async fn get_all(
        &self,
        filter: &BookListRequest,
    ) -> Result<BookListResponse, BookRepositoryError> {
        let window = PageWindow::resolve(filter, self.default_page_limit)?;

        let mut params = QueryParams::new();
        let mut condition = String::from(" WHERE TRUE");
        if let Some(search) = search_term(filter) {
            condition.push_str(r#" AND ("title" ILIKE :search OR "author" ILIKE :search)"#);
            params.insert("search", contains_pattern(search).into());
        }

        let mut query = format!(
            r#"SELECT {BOOK_COLUMNS}, COUNT(*) OVER() AS "total_count" FROM "book"{condition} ORDER BY "created_at" DESC, "id" DESC"#
        );
        if window.offset > 0 {
            query.push_str(" OFFSET :offset");
            params.insert("offset", window.offset.into());
        }
        if let Some(limit) = window.limit {
            query.push_str(" LIMIT :limit");
            params.insert("limit", limit.into());
        }
        let page_query = replace_query_params(&query, &params)?;

        let connection = self.connection().await?;
        let client = connection.client()?;
        let rows = self
            .run(
                &connection,
                client.query(page_query.sql.as_str(), &page_query.params()),
            )
            .await?;

        let count = match rows.first() {
            Some(row) => row.try_get("total_count")?,
            // The window is past the last match, so the window function saw no rows
            None if window.offset > 0 => {
                let count_query =
                    replace_query_params(&format!(r#"SELECT COUNT(*) FROM "book"{condition}"#), &params)?;
                self.run(
                    &connection,
                    client.query_one(count_query.sql.as_str(), &count_query.params()),
                )
                .await?
                .try_get(0)?
            }
            None => 0,
        };

        let books = rows
            .iter()
            .map(book_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BookListResponse { books, count })
    }

    async fn update(&self, book_id: &str, book: &UpdateBook) -> Result<u64, BookRepositoryError> {
        let connection = self.connection().await?;
        let client = connection.client()?;
        self.run(&connection, async {
            let stmt = client
                .prepare_cached(
                    r#"
                UPDATE "book"
                SET
                    "title" = $1,
                    "cover" = $2,
                    "author" = $3,
                    "published" = $4,
                    "pages" = $5,
                    "status" = $6,
                    "updated_at" = NOW()
                WHERE "id" = $7
                "#,
                )
                .await?;
            client
                .execute(
                    &stmt,
                    &[
                        &book.title,
                        &book.cover,
                        &book.author,
                        &book.published,
                        &book.pages,
                        &book.status,
                        &book_id,
                    ],
                )
                .await
        })
        .await
    }

    async fn update_patch(&self, request: &UpdatePatchRequest) -> Result<u64, BookRepositoryError> {
        if request.fields.is_empty() {
            return Err(BookRepositoryError::InvalidArgument(
                "no updates provided".to_string(),
            ));
        }

        let mut params = QueryParams::new();
        let mut assignments = Vec::with_capacity(request.fields.len());
        for value in request.fields.values() {
            let column = value.field().name();
            assignments.push(format!(r#""{column}" = :{column}"#));
            params.insert(column, field_value(value));
        }
        params.insert("id", request.id.as_str().into());

        let update_query = replace_query_params(
            &format!(
                r#"UPDATE "book" SET {}, "updated_at" = NOW() WHERE "id" = :id"#,
                assignments.join(", ")
            ),
            &params,
        )?;

        let connection = self.connection().await?;
        let client = connection.client()?;
        self.run(
            &connection,
            client.execute(update_query.sql.as_str(), &update_query.params()),
        )
        .await
    }

    async fn delete(&self, book_id: &str) -> Result<(), BookRepositoryError> {
        let connection = self.connection().await?;
        let client = connection.client()?;
        self.run(&connection, async {
            let stmt = client
                .prepare_cached(r#"DELETE FROM "book" WHERE "id" = $1"#)
                .await?;
            client.execute(&stmt, &[&book_id]).await
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod postgres_book_repository_tests {
    use std::collections::HashSet;

    use serial_test::file_serial;
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt};

    use crate::api::BookPatch;
    use crate::settings::Settings;
    use crate::storage::create_pool;

    use super::*;

    async fn start_postgres_container_and_init_repo(
    ) -> (ContainerAsync<GenericImage>, PostgresBooksRepository) {
        let _pg_container = GenericImage::new("postgres", "latest")
            .with_mapped_port(5432, 5432.tcp())
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await
            .expect("Failed to start postgres");

        let settings = Settings {
            postgres_host: "127.0.0.1".to_string(),
            postgres_database: "postgres".to_string(),
            ..Settings::default()
        };
        for _ in 0..10 {
            let pool = create_pool(&settings).expect("Failed to create pool");
            let repo = PostgresBooksRepository::new(pool, Duration::from_secs(5), 0);
            if repo.create_schema().await.is_ok() {
                return (_pg_container, repo);
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        panic!("Failed to setup postgres container")
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

    fn titled(title: &str, author: &str) -> CreateBook {
        CreateBook {
            isbn: format!("isbn-{title}"),
            title: title.to_string(),
            author: author.to_string(),
            ..CreateBook::default()
        }
    }

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("orwell"), "%orwell%");
        assert_eq!(contains_pattern("100%_\\"), "%100\\%\\_\\\\%");
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Tests create, get_by_pkey, get_by_title and delete
    /// for the sake of not starting container multiple times it tests everything in one testcase
    async fn test_create_book_get_and_delete_it() {
        let (_container, repo) = start_postgres_container_and_init_repo().await;

        let book_not_found = repo.get_by_pkey("not-existing").await;
        assert!(matches!(
            book_not_found,
            Err(BookRepositoryError::NotFound(..))
        ));

        let id = repo.create(&orwell_1984()).await.expect("Failed to create book");
        let other_id = repo.create(&orwell_1984()).await.expect("Failed to create book");
        assert!(!id.is_empty());
        assert_ne!(id, other_id);

        let book = repo.get_by_pkey(&id).await.expect("Failed to get book");
        assert_eq!(book.id, id);
        assert_eq!(book.isbn, "978-0");
        assert_eq!(book.title, "1984");
        assert_eq!(book.author, "Orwell");
        assert_eq!(book.pages, 328);
        assert_eq!(book.status, 1);
        assert_eq!(book.published, None);
        assert_eq!(book.created_at, book.updated_at);

        let invalid = repo
            .create(&CreateBook {
                pages: -5,
                ..orwell_1984()
            })
            .await;
        assert!(matches!(
            invalid,
            Err(BookRepositoryError::ConstraintViolation(..))
        ));

        assert_eq!(repo.get_by_title("no such title").await.unwrap(), None);
        assert_eq!(repo.get_by_title("%").await.unwrap(), None);
        let by_title = repo
            .get_by_title("98")
            .await
            .unwrap()
            .expect("Book not found");
        assert_eq!(by_title.title, "1984");

        repo.delete(&id).await.expect("Failed to delete");
        repo.delete(&id).await.expect("Failed to delete twice");
        assert!(matches!(
            repo.get_by_pkey(&id).await,
            Err(BookRepositoryError::NotFound(..))
        ));
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Tests if get_all filters, counts and pages
    /// for the sake of not starting container multiple times it tests everything in one testcase
    async fn test_create_books_and_list_them() {
        let (_container, repo) = start_postgres_container_and_init_repo().await;

        let list = repo
            .get_all(&BookListRequest::default())
            .await
            .expect("Failed to list books");
        assert_eq!(list, BookListResponse::default());

        let mut created = vec![];
        for (title, author) in [
            ("1984", "George Orwell"),
            ("Dune", "Frank Herbert"),
            ("Orwell's Essays", "Various"),
            ("Emma", "Jane Austen"),
            ("Persuasion", "Jane Austen"),
        ] {
            created.push(repo.create(&titled(title, author)).await.unwrap());
        }

        let orwell = repo
            .get_all(&BookListRequest {
                search: Some("ORWELL".to_string()),
                limit: Some(1),
                offset: None,
            })
            .await
            .unwrap();
        assert_eq!(orwell.count, 2);
        assert_eq!(orwell.books.len(), 1);

        let page = |offset| BookListRequest {
            search: None,
            limit: Some(2),
            offset: Some(offset),
        };
        let mut listed = vec![];
        for offset in [0, 2, 4] {
            let list = repo.get_all(&page(offset)).await.unwrap();
            assert_eq!(list.count, 5);
            listed.extend(list.books);
        }
        let listed_ids: Vec<BookId> = listed.iter().map(|book| book.id.clone()).collect();
        assert_eq!(
            listed_ids.iter().collect::<HashSet<_>>(),
            created.iter().collect::<HashSet<_>>()
        );
        assert_eq!(listed_ids.len(), 5);
        assert!(listed
            .windows(2)
            .all(|pair| pair[0].created_at >= pair[1].created_at));

        let past_the_end = repo.get_all(&page(10)).await.unwrap();
        assert!(past_the_end.books.is_empty());
        assert_eq!(past_the_end.count, 5);

        let wildcard = repo
            .get_all(&BookListRequest {
                search: Some("_".to_string()),
                ..BookListRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(wildcard.count, 0);
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Tests update and update_patch
    /// for the sake of not starting container multiple times it tests everything in one testcase
    async fn test_create_book_update_and_patch_it() {
        let (_container, repo) = start_postgres_container_and_init_repo().await;

        let not_existing = repo
            .update("not-existing", &UpdateBook::default())
            .await
            .expect("Failed to update");
        assert_eq!(not_existing, 0);

        let id = repo.create(&orwell_1984()).await.unwrap();
        let created = repo.get_by_pkey(&id).await.unwrap();

        let update = UpdateBook {
            title: "Nineteen Eighty-Four".to_string(),
            cover: "https://covers/1984.png".to_string(),
            author: "George Orwell".to_string(),
            published: Some("1949-06-08T00:00:00Z".parse().unwrap()),
            pages: 336,
            status: 2,
        };
        assert_eq!(repo.update(&id, &update).await.unwrap(), 1);
        let updated = repo.get_by_pkey(&id).await.unwrap();
        assert_eq!(
            updated,
            Book {
                title: update.title.clone(),
                cover: update.cover.clone(),
                author: update.author.clone(),
                published: update.published,
                pages: update.pages,
                status: update.status,
                updated_at: updated.updated_at,
                ..created.clone()
            }
        );
        assert!(updated.updated_at > created.updated_at);

        let empty_patch = repo
            .update_patch(&UpdatePatchRequest {
                id: id.clone(),
                fields: BookPatch::new(),
            })
            .await;
        assert!(matches!(
            empty_patch,
            Err(BookRepositoryError::InvalidArgument(..))
        ));
        assert_eq!(repo.get_by_pkey(&id).await.unwrap(), updated);

        let patch = BookPatch::new()
            .with(BookFieldValue::Isbn("978-1".to_string()))
            .with(BookFieldValue::Published(None))
            .with(BookFieldValue::Status(3));
        let affected = repo
            .update_patch(&UpdatePatchRequest {
                id: id.clone(),
                fields: patch,
            })
            .await
            .expect("Failed to patch");
        assert_eq!(affected, 1);

        let patched = repo.get_by_pkey(&id).await.unwrap();
        assert_eq!(
            patched,
            Book {
                isbn: "978-1".to_string(),
                published: None,
                status: 3,
                updated_at: patched.updated_at,
                ..updated.clone()
            }
        );
        assert!(patched.updated_at > updated.updated_at);

        let invalid_patch = repo
            .update_patch(&UpdatePatchRequest {
                id: id.clone(),
                fields: BookPatch::new().with(BookFieldValue::Pages(-1)),
            })
            .await;
        assert!(matches!(
            invalid_patch,
            Err(BookRepositoryError::ConstraintViolation(..))
        ));

        let missing = repo
            .update_patch(&UpdatePatchRequest {
                id: "not-existing".to_string(),
                fields: BookPatch::new().with(BookFieldValue::Title("x".to_string())),
            })
            .await
            .unwrap();
        assert_eq!(missing, 0);
    }

    /// Waits until no `pg_sleep` statement is running on the server
    async fn wait_for_sleeps_to_stop(repo: &PostgresBooksRepository) -> bool {
        let client = repo.pool.get().await.expect("Failed to get connection");
        for _ in 0..50 {
            let active: i64 = client
                .query_one(
                    "SELECT COUNT(*) FROM pg_stat_activity WHERE state = 'active' AND query LIKE 'SELECT pg_sleep%'",
                    &[],
                )
                .await
                .expect("Failed to read pg_stat_activity")
                .get(0);
            if active == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Tests that a query over the timeout, or one whose future is dropped,
    /// is cancelled on the server and the pool keeps serving queries
    async fn test_slow_queries_are_cancelled() {
        let (_container, repo) = start_postgres_container_and_init_repo().await;
        let impatient_repo =
            PostgresBooksRepository::new(repo.pool.clone(), Duration::from_millis(100), 0);

        let connection = impatient_repo.connection().await.unwrap();
        let client = connection.client().unwrap();
        let timed_out = impatient_repo
            .run(&connection, client.query("SELECT pg_sleep(5)", &[]))
            .await;
        assert!(matches!(timed_out, Err(BookRepositoryError::Timeout)));
        drop(connection);
        assert!(wait_for_sleeps_to_stop(&repo).await, "Timed out query still running");

        let abandoned = tokio::time::timeout(Duration::from_millis(100), async {
            let connection = repo.connection().await?;
            let client = connection.client()?;
            repo.run(&connection, client.query("SELECT pg_sleep(5)", &[]))
                .await
        })
        .await;
        assert!(abandoned.is_err());
        assert!(wait_for_sleeps_to_stop(&repo).await, "Dropped query still running");

        // every connection handed out now is a fresh one, nothing left to cancel
        for _ in 0..5 {
            assert!(matches!(
                impatient_repo.get_by_pkey("not-existing").await,
                Err(BookRepositoryError::NotFound(..))
            ));
        }
        let id = repo.create(&orwell_1984()).await.expect("Failed to create book");
        assert_eq!(impatient_repo.get_by_pkey(&id).await.unwrap().id, id);
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Tests how postgres errors are classified
    /// for the sake of not starting container multiple times it tests everything in one testcase
    async fn test_postgres_errors_are_classified() {
        let (_container, repo) = start_postgres_container_and_init_repo().await;

        let connection = repo.connection().await.unwrap();
        let client = connection.client().unwrap();

        let out_of_range = repo
            .run(&connection, client.query_one("SELECT 2147483648::integer", &[]))
            .await;
        assert!(matches!(
            out_of_range,
            Err(BookRepositoryError::InvalidArgument(..))
        ));

        client
            .batch_execute("SET statement_timeout = 50")
            .await
            .unwrap();
        let cancelled_by_server = repo
            .run(&connection, client.query_one("SELECT pg_sleep(1)", &[]))
            .await;
        client.batch_execute("RESET statement_timeout").await.unwrap();
        assert!(matches!(
            cancelled_by_server,
            Err(BookRepositoryError::Timeout)
        ));
        drop(connection);

        let detached = Object::take(repo.pool.get().await.unwrap());
        let _ = detached
            .batch_execute("SELECT pg_terminate_backend(pg_backend_pid())")
            .await;
        for _ in 0..20 {
            if detached.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let err = detached
            .query_one("SELECT 1", &[])
            .await
            .expect_err("Query on terminated connection succeeded");
        assert!(matches!(
            BookRepositoryError::from(err),
            BookRepositoryError::ConnectionError(..)
        ));
    }
}
