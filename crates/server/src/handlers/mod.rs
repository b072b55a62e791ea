pub mod auth;
pub mod devices;
pub mod geocode;
pub mod health;
pub mod routes;
pub mod stream;
