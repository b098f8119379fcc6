pub mod conversations;
pub mod error;
pub mod events;
pub mod identity;
pub mod notifications;
pub mod ports;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
