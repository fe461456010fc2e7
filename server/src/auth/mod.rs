pub mod jwt;

pub use jwt::{JwtVerifier, TokenVerifier};
