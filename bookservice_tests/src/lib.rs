//! End to end tests run against a deployed book service.
//! Point `BOOKSERVICE_URL` at the service, default is `http://127.0.0.1:8080`.



#[cfg(any(feature = "system_tests", feature = "load_tests"))]
fn bookservice_url() -> String {
    std::env::var("BOOKSERVICE_URL").unwrap_or("http://127.0.0.1:8080".to_string())
}
