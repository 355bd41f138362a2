use actix_web::error::InternalError;
use paperclip::actix::web;

use crate::handlers;
use crate::service::{Code, ServiceError};

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api/books")
                .service(
                    web::resource("")
                        .route(web::get().to(handlers::get_books))
                        .route(web::post().to(handlers::create_book)),
                )
                // registered before `/{book_id}` so it is not taken for an id
                .service(
                    web::resource("/by-title").route(web::get().to(handlers::get_book_by_title)),
                )
                .service(
                    web::resource("/{book_id}")
                        .route(web::get().to(handlers::get_book))
                        .route(web::put().to(handlers::update_book))
                        .route(web::patch().to(handlers::patch_book))
                        .route(web::delete().to(handlers::delete_book)),
                ),
        );
}

/// Malformed json bodies, including unknown patch fields, are reported as invalid argument
pub fn json_config() -> actix_web::web::JsonConfig {
    actix_web::web::JsonConfig::default().error_handler(|err, _req| {
        let response =
            handlers::error_response(ServiceError::new(Code::InvalidArgument, err.to_string()));
        InternalError::from_response(err, response).into()
    })
}

pub fn query_config() -> actix_web::web::QueryConfig {
    actix_web::web::QueryConfig::default().error_handler(|err, _req| {
        let response =
            handlers::error_response(ServiceError::new(Code::InvalidArgument, err.to_string()));
        InternalError::from_response(err, response).into()
    })
}
