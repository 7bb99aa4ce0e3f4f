//! Symbol server download client.
//!
//! Fetches PDBs from a Microsoft-style symbol archive using the
//! `{pdb_name}/{GUID}{age}/{pdb_name}` URL scheme. Bodies are streamed straight
//! into the caller's writer, so large PDBs never sit in memory.

use qpdb::archive;
use qpdb::{DebugIdentity, QpdbError, QpdbResult};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_SYMBOL_SERVER: &str = "http://msdl.microsoft.com/download/symbols/";
const USER_AGENT: &str = "Microsoft-Symbol-Server/10.0.0.0";

/// CAB archive magic bytes.
const CAB_MAGIC: &[u8; 4] = b"MSCF";

/// Source of PDB bytes for an identity.
pub trait Fetch: Send + Sync {
    /// Write the archived PDB for `identity` into `out`, returning the byte count.
    fn fetch(&self, identity: &DebugIdentity, out: &mut dyn Write) -> QpdbResult<u64>;
}

/// HTTP(S) symbol archive.
pub struct HttpArchive {
    base: String,
    agent: ureq::Agent,
}

impl HttpArchive {
    pub fn new(base: impl Into<String>) -> Self {
        // ureq follows redirects by default; msdl answers with a redirect to its CDN.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(120))
            .build();
        HttpArchive {
            base: base.into(),
            agent,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn url_for(&self, identity: &DebugIdentity) -> String {
        archive::download_url(&self.base, identity)
    }
}

impl Fetch for HttpArchive {
    fn fetch(&self, identity: &DebugIdentity, out: &mut dyn Write) -> QpdbResult<u64> {
        let url = self.url_for(identity);
        info!("Downloading PDB from: {}", url);

        let response = self
            .agent
            .get(&url)
            .set("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(404, _) => {
                    QpdbError::download(&url, "PDB not found on symbol server (404)")
                }
                ureq::Error::Status(code, _) => {
                    QpdbError::download(&url, format!("symbol server returned HTTP {}", code))
                }
                other => QpdbError::download(&url, format!("request failed: {}", other)),
            })?;

        copy_body(response.into_reader(), out).map_err(|e| match e {
            BodyError::Cab => QpdbError::download(
                &url,
                "symbol server returned a CAB-compressed PDB, which is not supported",
            ),
            BodyError::Io(e) => QpdbError::download(&url, format!("streaming body: {}", e)),
        })
    }
}

#[derive(Debug)]
enum BodyError {
    Cab,
    Io(io::Error),
}

/// Stream a response body into `out`, refusing CAB archives up front.
fn copy_body(mut body: impl Read, out: &mut dyn Write) -> Result<u64, BodyError> {
    let mut head = Vec::with_capacity(CAB_MAGIC.len());
    body.by_ref()
        .take(CAB_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .map_err(BodyError::Io)?;
    if head.as_slice() == CAB_MAGIC {
        return Err(BodyError::Cab);
    }
    out.write_all(&head).map_err(BodyError::Io)?;
    Ok(head.len() as u64 + io::copy(&mut body, out).map_err(BodyError::Io)?)
}
