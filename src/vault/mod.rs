//! Session vault: encrypted OAuth credentials and the session cookie.
//!
//! ## Security Model
//!
//! - Tokens are encrypted with ChaCha20-Poly1305 under a key derived from a
//!   shared passphrase, with a fresh nonce per encryption
//! - Only an opaque session id crosses into the browser, in an `HttpOnly` cookie
//! - Records that fail to decrypt are deleted rather than surfaced
//! - Decrypted credentials are zeroized on drop
//!
//! ## Usage
//!
//! ```ignore
//! let vault = SessionVault::new(store, issuer, &config.session, CookieContext::Secure);
//!
//! let ctx = vault.get_session_context(&jar).await?;
//! let jar = ctx.cookie.apply(jar);
//! if let Some(credentials) = ctx.credentials {
//!     // call the provider with credentials.access_token
//! }
//! ```

pub mod cookie;
pub mod crypto;
pub mod oauth;
pub mod session;
pub mod store;

pub use cookie::{CookieContext, CookiePolicy, OAUTH_STATE_COOKIE, SESSION_COOKIE};
pub use crypto::{decrypt, encrypt, CryptoError, TokenCipher};
pub use oauth::{DiscordOAuth, TokenGrant, TokenIssuer};
pub use session::{CookieDirective, SessionContext, SessionCredentials, SessionRecord, SessionVault};
pub use store::{DbPool, KvStore, MemoryKvStore, SqliteKvStore};
