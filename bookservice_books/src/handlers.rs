use actix_web::web::Data;
use actix_web::{Error, HttpResponse};
use paperclip::actix::{api_v2_operation, web};

use crate::api::{
    BookByTitleRequest, BookId, BookListRequest, BookPatch, CreateBook, ErrorResponse, UpdateBook,
};
use crate::service::{BookService, Code, ServiceError};

pub(crate) fn error_response(err: ServiceError) -> HttpResponse {
    let mut response = match err.code {
        Code::InvalidArgument => HttpResponse::BadRequest(),
        Code::NotFound => HttpResponse::NotFound(),
        Code::Unavailable => HttpResponse::ServiceUnavailable(),
        Code::DeadlineExceeded => HttpResponse::GatewayTimeout(),
        Code::Internal => HttpResponse::InternalServerError(),
    };
    response.json(ErrorResponse {
        code: err.code.as_str().to_string(),
        message: err.message,
    })
}

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

#[api_v2_operation]
pub async fn create_book(
    service: Data<BookService>,
    request: web::Json<CreateBook>,
) -> Result<HttpResponse, Error> {
    Ok(match service.create(request.into_inner()).await {
        Ok(book) => HttpResponse::Ok().json(book),
        Err(err) => error_response(err),
    })
}

#[api_v2_operation]
pub async fn get_book(
    service: Data<BookService>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match service.get_by_id(&book_id).await {
        Ok(book) => HttpResponse::Ok().json(book),
        Err(err) => error_response(err),
    })
}

#[api_v2_operation]
pub async fn get_book_by_title(
    service: Data<BookService>,
    request: web::Query<BookByTitleRequest>,
) -> Result<HttpResponse, Error> {
    Ok(match service.get_book_by_title(request.into_inner()).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(err) => error_response(err),
    })
}

#[api_v2_operation]
pub async fn get_books(
    service: Data<BookService>,
    request: web::Query<BookListRequest>,
) -> Result<HttpResponse, Error> {
    Ok(match service.get_list(request.into_inner()).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(err) => error_response(err),
    })
}

#[api_v2_operation]
pub async fn update_book(
    service: Data<BookService>,
    book_id: web::Path<BookId>,
    request: web::Json<UpdateBook>,
) -> Result<HttpResponse, Error> {
    Ok(match service.update(&book_id, request.into_inner()).await {
        Ok(book) => HttpResponse::Ok().json(book),
        Err(err) => error_response(err),
    })
}

#[api_v2_operation]
pub async fn patch_book(
    service: Data<BookService>,
    book_id: web::Path<BookId>,
    patch: web::Json<BookPatch>,
) -> Result<HttpResponse, Error> {
    Ok(match service.update_patch(&book_id, patch.into_inner()).await {
        Ok(book) => HttpResponse::Ok().json(book),
        Err(err) => error_response(err),
    })
}

#[api_v2_operation]
pub async fn delete_book(
    service: Data<BookService>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match service.delete(&book_id).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => error_response(err),
    })
}
