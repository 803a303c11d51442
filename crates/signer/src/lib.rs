pub mod c14n;
pub mod credential;
pub mod xades;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use credential::{CertificateStore, CredentialError, SigningCredential};
pub use xades::{SignError, SignatureInfo, SignedDocument, VerificationError, XadesSigner};
