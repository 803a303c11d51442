pub mod access_key;
pub mod document;
pub mod models;
pub mod parsing;
pub mod validation;

pub use access_key::{AccessKey, AccessKeyError};
pub use document::{CanonicalXmlDocument, DocumentError, InvoiceDocumentBuilder};
pub use models::*;
