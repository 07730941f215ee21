use crate::masking;
use odbc_api::escape_attribute_value;
use secrecy::{ExposeSecret, SecretString};

/// ODBC connection string assembled attribute by attribute.
pub struct ConnectionString {
    parts: Vec<String>,
}

impl ConnectionString {
    pub fn with_driver(driver: &str) -> Self {
        Self {
            parts: vec![format!("Driver={{{}}}", driver)],
        }
    }

    pub fn push(&mut self, key: &str, value: &str) -> &mut Self {
        self.parts.push(format!("{}={}", key, escape_attribute_value(value)));
        self
    }

    pub fn push_opt(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.push(key, value);
        }
        self
    }

    pub fn push_secret(&mut self, key: &str, value: &SecretString) -> &mut Self {
        self.push(key, value.expose_secret())
    }

    /// The full string, credentials included.
    pub fn as_secret(&self) -> String {
        self.parts.join(";") + ";"
    }

    /// Same string with passwords redacted, for logs.
    pub fn masked(&self) -> String {
        masking::mask_connection_string(&self.as_secret())
    }
}
