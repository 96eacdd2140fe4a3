use crate::application::auth::Registration;
use crate::error::{MarketError, Result};
use std::io::Read;

/// Reads account seed records from a CSV source.
///
/// Expected columns: `username, email, password, role`, optionally followed by
/// `organization_name, organization_type, wallet_address`. Whitespace is
/// trimmed and short records are accepted; empty optional fields are treated
/// as absent.
pub struct UserReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> UserReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes one registration per record.
    pub fn registrations(self) -> impl Iterator<Item = Result<Registration>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(MarketError::from))
    }
}
