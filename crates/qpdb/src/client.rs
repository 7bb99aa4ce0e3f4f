//! Blocking client for a qpdb query server.
//!
//! The client identifies a module from its image on disk and asks the server
//! for symbol addresses, field offsets and enum values of the matching PDB.
//! The bulk methods return whatever the server resolved; the single-name
//! helpers turn a missing name into [`QpdbError::NotFound`].

use crate::error::{QpdbError, QpdbResult};
use crate::identity::DebugIdentity;
use crate::types::{
    EnumMap, FieldInfo, NestedQuery, NestedRequest, StructMap, SymbolMap, SymbolRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Query client bound to one module identity and one server.
pub struct QueryClient {
    identity: DebugIdentity,
    server: String,
    agent: ureq::Agent,
}

impl QueryClient {
    pub fn new(identity: DebugIdentity, server: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .build();
        QueryClient {
            identity,
            server: server.into(),
            agent,
        }
    }

    /// Read an executable image and bind a client to its debug identity.
    pub fn from_image(path: impl AsRef<Path>, server: impl Into<String>) -> QpdbResult<Self> {
        let identity = DebugIdentity::from_file(path)?;
        Ok(Self::new(identity, server))
    }

    pub fn identity(&self) -> &DebugIdentity {
        &self.identity
    }

    /// Usable only with a server URL and a complete identity.
    pub fn is_valid(&self) -> bool {
        !self.server.is_empty() && self.identity.is_valid()
    }

    pub fn symbols(&self, names: &BTreeSet<String>) -> QpdbResult<SymbolMap> {
        let body = SymbolRequest {
            identity: self.identity.clone(),
            query: names.clone(),
        };
        self.post("symbol", &body)
    }

    pub fn symbol(&self, name: &str) -> QpdbResult<i64> {
        let mut found = self.symbols(&BTreeSet::from([name.to_string()]))?;
        found
            .remove(name)
            .ok_or_else(|| QpdbError::NotFound(format!("symbol {}", name)))
    }

    pub fn structs(&self, query: &NestedQuery) -> QpdbResult<StructMap> {
        self.post("struct", &self.nested(query))
    }

    pub fn struct_fields(
        &self,
        name: &str,
        fields: &BTreeSet<String>,
    ) -> QpdbResult<BTreeMap<String, FieldInfo>> {
        let query = NestedQuery::from([(name.to_string(), fields.clone())]);
        let mut found = self.structs(&query)?;
        found
            .remove(name)
            .ok_or_else(|| QpdbError::NotFound(format!("struct {}", name)))
    }

    pub fn field(&self, name: &str, field: &str) -> QpdbResult<FieldInfo> {
        let mut fields = self.struct_fields(name, &BTreeSet::from([field.to_string()]))?;
        fields
            .remove(field)
            .ok_or_else(|| QpdbError::NotFound(format!("field {}.{}", name, field)))
    }

    pub fn enums(&self, query: &NestedQuery) -> QpdbResult<EnumMap> {
        self.post("enum", &self.nested(query))
    }

    pub fn enum_values(
        &self,
        name: &str,
        keys: &BTreeSet<String>,
    ) -> QpdbResult<BTreeMap<String, i64>> {
        let query = NestedQuery::from([(name.to_string(), keys.clone())]);
        let mut found = self.enums(&query)?;
        found
            .remove(name)
            .ok_or_else(|| QpdbError::NotFound(format!("enum {}", name)))
    }

    pub fn enum_value(&self, name: &str, key: &str) -> QpdbResult<i64> {
        let mut values = self.enum_values(name, &BTreeSet::from([key.to_string()]))?;
        values
            .remove(key)
            .ok_or_else(|| QpdbError::NotFound(format!("enumerator {}::{}", name, key)))
    }

    fn nested(&self, query: &NestedQuery) -> NestedRequest {
        NestedRequest {
            identity: self.identity.clone(),
            query: query.clone(),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.server.trim_end_matches('/'), name)
    }

    fn post<B: Serialize, R: DeserializeOwned>(&self, name: &str, body: &B) -> QpdbResult<R> {
        if !self.is_valid() {
            return Err(QpdbError::InvalidIdentity);
        }

        let url = self.endpoint(name);
        let payload =
            serde_json::to_string(body).map_err(|e| QpdbError::Request(e.to_string()))?;
        debug!("POST {} ({} bytes)", url, payload.len());

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&payload)
            .map_err(|e| match e {
                ureq::Error::Status(code, resp) => QpdbError::Request(format!(
                    "{} returned HTTP {}: {}",
                    url,
                    code,
                    resp.into_string().unwrap_or_default()
                )),
                other => QpdbError::Request(format!("{}: {}", url, other)),
            })?;

        let text = response
            .into_string()
            .map_err(|e| QpdbError::Request(format!("reading response from {}: {}", url, e)))?;
        serde_json::from_str(&text)
            .map_err(|e| QpdbError::Request(format!("decoding response from {}: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::{build_pe, rsds_record};

    #[test]
    fn test_from_image() {
        let pe = build_pe(0x8664, &rsds_record("ntkrnlmp.pdb", 1));
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), &pe).unwrap();

        let client = QueryClient::from_image(tmp.path(), "http://127.0.0.1:8080/").unwrap();
        assert!(client.is_valid());
        assert_eq!(client.identity().file_name, "ntkrnlmp.pdb");
    }

    #[test]
    fn test_invalid_without_server() {
        let client = QueryClient::new(DebugIdentity::new("a.pdb", "AB", 1), "");
        assert!(!client.is_valid());
    }

    #[test]
    fn test_invalid_identity_fails_before_network() {
        // Unroutable address; the call must fail without connecting.
        let client = QueryClient::new(DebugIdentity::default(), "http://192.0.2.1:9");
        assert!(matches!(client.symbol("KdpStub"), Err(QpdbError::InvalidIdentity)));
    }

    #[test]
    fn test_endpoint_join() {
        let client = QueryClient::new(DebugIdentity::new("a.pdb", "AB", 1), "http://host:9025/");
        assert_eq!(client.endpoint("struct"), "http://host:9025/struct");
        let client = QueryClient::new(DebugIdentity::new("a.pdb", "AB", 1), "http://host:9025");
        assert_eq!(client.endpoint("enum"), "http://host:9025/enum");
    }
}
