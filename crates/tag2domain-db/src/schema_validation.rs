//! Identifier validation for table and column names that end up in SQL text.
//!
//! Intersection table layouts come from configuration and are spliced into
//! statements, so every name is checked once before any statement is built.

use tag2domain_core::{Error, Result};

/// PostgreSQL identifier length limit.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const RESERVED_KEYWORDS: &[&str] = &[
    "pg_catalog",
    "information_schema",
    "pg_toast",
    "select",
    "insert",
    "update",
    "delete",
    "drop",
    "create",
    "alter",
    "grant",
    "revoke",
    "truncate",
    "table",
    "where",
    "from",
];

/// Validate a bare PostgreSQL identifier.
///
/// Identifiers must:
/// - Not be empty
/// - Not exceed 63 characters
/// - Contain only ASCII alphanumeric characters and underscores
/// - Not start with a digit
/// - Not be a SQL keyword (basic check)
///
/// # Examples
///
/// ```
/// use tag2domain_db::validate_identifier;
///
/// assert!(validate_identifier("domain_id").is_ok());
/// assert!(validate_identifier("1st").is_err());
/// assert!(validate_identifier("").is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("Identifier cannot be empty".to_string()));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!(
            "Identifier '{}' exceeds 63 character limit: {} characters",
            name,
            name.len()
        )));
    }

    if let Some(first) = name.chars().next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(Error::Config(format!(
                "Identifier '{}' must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(ch) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(Error::Config(format!(
            "Identifier '{}' contains invalid character: '{}'. Only alphanumeric and underscore allowed",
            name, ch
        )));
    }

    if RESERVED_KEYWORDS.contains(&name.to_lowercase().as_str()) {
        return Err(Error::Config(format!(
            "Identifier '{}' is a reserved SQL keyword",
            name
        )));
    }

    Ok(())
}

/// Validate a table name, optionally qualified by exactly one schema.
///
/// ```
/// use tag2domain_db::validate_table_name;
///
/// assert!(validate_table_name("domain_tags").is_ok());
/// assert!(validate_table_name("tag2domain.domain_tags").is_ok());
/// assert!(validate_table_name("a.b.c").is_err());
/// ```
pub fn validate_table_name(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(Error::Config(format!(
            "Table name '{}' may contain at most one schema qualifier",
            name
        )));
    }
    for part in parts {
        validate_identifier(part)?;
    }
    Ok(())
}
