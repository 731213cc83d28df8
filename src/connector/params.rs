//! Server parameters reported during and after startup.

use std::collections::HashMap;

/// Snapshot of the ParameterStatus values the server has reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendParams {
    values: HashMap<String, String>,
    process_id: u32,
    secret_key: u32,
}

impl BackendParams {
    pub(crate) fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            process_id: 0,
            secret_key: 0,
        }
    }

    pub(crate) fn set_backend_key(&mut self, process_id: u32, secret_key: u32) {
        self.process_id = process_id;
        self.secret_key = secret_key;
    }

    pub(crate) fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    /// Raw parameter lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn secret_key(&self) -> u32 {
        self.secret_key
    }

    pub fn server_version(&self) -> Option<&str> {
        self.get("server_version")
    }

    pub fn client_encoding(&self) -> Option<&str> {
        self.get("client_encoding")
    }

    pub fn standard_conforming_strings(&self) -> bool {
        self.get("standard_conforming_strings") == Some("on")
    }

    pub fn integer_datetimes(&self) -> bool {
        self.get("integer_datetimes") == Some("on")
    }

    /// `(major, minor)` parsed from `server_version`.
    ///
    /// Handles both `9.6.24` and `16.2 (Debian 16.2-1)` spellings.
    pub fn version(&self) -> Option<(u32, u32)> {
        let version = self.server_version()?;
        let numeric = version
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()?;
        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some((major, minor))
    }

    /// E'...' literals exist from 8.1 on.
    pub fn supports_e_string_prefix(&self) -> bool {
        self.version().is_some_and(|v| v >= (8, 1))
    }

    /// bytea output defaults to hex from 9.0 on.
    pub fn supports_hex_bytea_output(&self) -> bool {
        self.version().is_some_and(|v| v >= (9, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(version: &str) -> BackendParams {
        BackendParams::new([
            ("server_version".to_string(), version.to_string()),
            ("standard_conforming_strings".to_string(), "on".to_string()),
        ])
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(params("16.2 (Debian 16.2-1.pgdg120+2)").version(), Some((16, 2)));
        assert_eq!(params("9.6.24").version(), Some((9, 6)));
        assert_eq!(params("17devel").version(), Some((17, 0)));
        assert_eq!(BackendParams::default().version(), None);
    }

    #[test]
    fn test_feature_flags() {
        let old = params("8.0.26");
        assert!(!old.supports_e_string_prefix());
        assert!(!old.supports_hex_bytea_output());

        let mid = params("8.4.22");
        assert!(mid.supports_e_string_prefix());
        assert!(!mid.supports_hex_bytea_output());

        let current = params("15.4");
        assert!(current.supports_hex_bytea_output());
        assert!(current.standard_conforming_strings());
        assert!(!current.integer_datetimes());
    }
}
