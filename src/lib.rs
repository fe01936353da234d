//! Application Default Credentials and OAuth2 token exchange for Google Cloud APIs.
//!
//! This crate is the client-side authentication core used to obtain short-lived
//! OAuth2 bearer tokens and ID tokens for calling Google APIs. Its value is not
//! any single token flow but the unified credential resolution and exchange
//! core: a polymorphic [`Credentials`](credentials::Credentials) abstraction,
//! Application Default Credentials discovery ([`adc`]), a single-flight
//! non-blocking token cache ([`credentials::oauth2`]), workload/workforce
//! identity federation ([`external_account`]), downscoped tokens ([`cab`],
//! [`credentials::downscoped`]), and IAM-mediated impersonation ([`iam`]).
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use google_cloud_auth::adc;
//!
//! let creds = adc::default_credentials(&Default::default()).await?;
//! let headers = creds.get_request_metadata("https://example.googleapis.com/v1/foo").await?;
//! println!("{headers:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adc;
pub mod cab;
pub mod clock;
pub mod consts;
pub mod credentials;
pub mod env;
pub mod error;
pub mod external_account;
pub mod http_client;
pub mod iam;
pub mod sources;
pub mod sts;
pub mod token;
pub mod trust_boundary;

pub use credentials::Credentials;
pub use error::{Error, Result};
pub use token::AccessToken;
