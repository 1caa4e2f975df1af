//! Short-code generation.
//!
//! Codes are 6 characters from a 62-symbol alphabet drawn from a
//! cryptographically secure RNG, checked against the `short_links` table
//! before being handed out. The check runs on the caller's transaction
//! connection; the unique index on `short_links.short_code` remains the final
//! arbiter when two writers race between check and insert.

use crate::services::metadata_store::MetadataStore;
use rand::Rng;
use sqlx::SqliteConnection;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const CODE_LENGTH: usize = 6;
pub const MAX_ATTEMPTS: usize = 10;

#[derive(Debug, Error)]
pub enum ShortCodeError {
    #[error("no unused short code found after {attempts} attempts")]
    Exhausted { attempts: usize },
    #[error(transparent)]
    Metadata(#[from] sqlx::Error),
}

/// Supplies candidate codes. Each call must be independent of earlier ones.
pub trait CodeSource: Send + Sync + 'static {
    fn draw(&self, length: usize) -> String;
}

/// Uniform draws from [`ALPHABET`] using the thread-local CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomCodeSource;

impl CodeSource for RandomCodeSource {
    fn draw(&self, length: usize) -> String {
        let mut rng = rand::rng();
        (0..length)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

#[derive(Clone)]
pub struct ShortCodeGenerator {
    source: Arc<dyn CodeSource>,
    length: usize,
    max_attempts: usize,
}

impl Default for ShortCodeGenerator {
    fn default() -> Self {
        Self::new(Arc::new(RandomCodeSource))
    }
}

impl ShortCodeGenerator {
    pub fn new(source: Arc<dyn CodeSource>) -> Self {
        Self {
            source,
            length: CODE_LENGTH,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Draw codes until one is not present in `short_links`.
    ///
    /// Every attempt is a fresh draw; there is no probing from a collided
    /// code. The returned code must be inserted on the same connection.
    pub async fn generate(&self, conn: &mut SqliteConnection) -> Result<String, ShortCodeError> {
        for attempt in 1..=self.max_attempts {
            let code = self.source.draw(self.length);
            if !MetadataStore::short_code_exists(&mut *conn, &code).await? {
                debug!(code = %code, attempt, "generated unique short code");
                return Ok(code);
            }
            warn!(
                code = %code,
                attempt,
                max_attempts = self.max_attempts,
                "short code already in use"
            );
        }
        Err(ShortCodeError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}

/// True if `code` has the shape this generator produces.
pub fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_alphanumeric())
}
