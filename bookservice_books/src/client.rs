use anyhow::Context;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;

use crate::api::{
    Book, BookByTitleResponse, BookListRequest, BookListResponse, BookPatch, CreateBook,
    ErrorResponse, UpdateBook,
};

pub struct BookServiceClient {
    url: String,
    client: ClientWithMiddleware,
}

async fn failure(response: reqwest::Response, operation: &str) -> anyhow::Error {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(error) => anyhow::anyhow!(
            "Failed to {} ({}) {}: {}",
            operation,
            status,
            error.code,
            error.message
        ),
        Err(_) => anyhow::anyhow!("Failed to {} ({})", operation, status),
    }
}

impl BookServiceClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let client = ClientBuilder::new(reqwest_client)
            // Insert the tracing middleware
            .with(TracingMiddleware::default())
            .build();

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    /// Calls POST /api/books endpoint
    /// Returns the book as stored, with generated id and timestamps
    pub async fn create_book(&self, book: &CreateBook) -> anyhow::Result<Book> {
        let response = self
            .client
            .post(format!("{}/api/books", self.url))
            .json(book)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(failure(response, "create book").await);
        }
        Ok(response.json().await?)
    }

    /// Calls GET /api/books/{book_id} endpoint
    /// None if the book is not stored
    pub async fn get_book(&self, book_id: &str) -> anyhow::Result<Option<Book>> {
        let response = self
            .client
            .get(format!("{}/api/books/{}", self.url, book_id))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(failure(response, "get book").await)
        }
    }

    /// Calls GET /api/books/by-title endpoint
    pub async fn get_book_by_title(&self, title: &str) -> anyhow::Result<Option<Book>> {
        let response = self
            .client
            .get(format!("{}/api/books/by-title", self.url))
            .query(&[("title", title)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(failure(response, "get book by title").await);
        }
        let response: BookByTitleResponse = response.json().await?;
        Ok(response.book)
    }

    /// Calls GET /api/books endpoint
    pub async fn list_books(&self, request: &BookListRequest) -> anyhow::Result<BookListResponse> {
        let response = self
            .client
            .get(format!("{}/api/books", self.url))
            .query(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(failure(response, "list books").await);
        }
        Ok(response.json().await?)
    }

    /// Calls PUT /api/books/{book_id} endpoint
    pub async fn update_book(&self, book_id: &str, update: &UpdateBook) -> anyhow::Result<Book> {
        let response = self
            .client
            .put(format!("{}/api/books/{}", self.url, book_id))
            .json(update)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(failure(response, "update book").await);
        }
        Ok(response.json().await?)
    }

    /// Calls PATCH /api/books/{book_id} endpoint
    pub async fn patch_book(&self, book_id: &str, patch: &BookPatch) -> anyhow::Result<Book> {
        let response = self
            .client
            .patch(format!("{}/api/books/{}", self.url, book_id))
            .json(patch)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(failure(response, "patch book").await);
        }
        Ok(response.json().await?)
    }

    /// Calls DELETE /api/books/{book_id} endpoint
    pub async fn delete_book(&self, book_id: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/books/{}", self.url, book_id))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(failure(response, "delete book").await);
        }
        Ok(())
    }
}
