//! Server-reported errors and notices.

use std::collections::HashMap;
use std::fmt;

/// Fields of an `ErrorResponse` (or `NoticeResponse`) message.
///
/// Reference: https://www.postgresql.org/docs/current/protocol-error-fields.html
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    /// SQLSTATE code.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset into the query text.
    pub position: Option<u32>,
    pub where_: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
}

impl ServerError {
    pub(crate) fn from_fields(mut fields: HashMap<u8, String>) -> Self {
        // 'V' is the non-localized severity, prefer it when present
        let severity = fields
            .remove(&b'V')
            .or_else(|| fields.remove(&b'S'))
            .unwrap_or_else(|| "ERROR".to_string());

        Self {
            severity,
            code: fields.remove(&b'C').unwrap_or_default(),
            message: fields.remove(&b'M').unwrap_or_default(),
            detail: fields.remove(&b'D'),
            hint: fields.remove(&b'H'),
            position: fields.remove(&b'P').and_then(|p| p.parse().ok()),
            where_: fields.remove(&b'W'),
            table: fields.remove(&b't'),
            column: fields.remove(&b'c'),
            constraint: fields.remove(&b'n'),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERREUR".to_string());
        fields.insert(b'V', "ERROR".to_string());
        fields.insert(b'C', "42P01".to_string());
        fields.insert(b'M', "relation \"t\" does not exist".to_string());
        fields.insert(b'P', "15".to_string());

        let err = ServerError::from_fields(fields);
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "42P01");
        assert_eq!(err.position, Some(15));
        assert!(err.detail.is_none());
        assert_eq!(
            err.to_string(),
            "ERROR: relation \"t\" does not exist (42P01)"
        );
    }
}
