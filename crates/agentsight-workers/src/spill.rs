// Writer spill file
//
// The only local persistent state in the pipeline: when the columnar
// store stays down past the writer's retry budget, buffered spans are
// appended here instead of being lost or unboundedly held in memory.
//
// Layout: 4-byte magic "AGSP", 4-byte LE version, then a sequence of
// records, each a 4-byte LE length prefix followed by a MessagePack-
// encoded span.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use agentsight_bus::{decode_span, encode_span};
use agentsight_contracts::Span;

pub const SPILL_MAGIC: [u8; 4] = *b"AGSP";
pub const SPILL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SpillError {
    #[error("spill file i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("spill file has bad magic or version")]
    BadHeader,
    #[error("spill record codec failed: {0}")]
    Codec(String),
}

/// Append spans to the spill file, writing the header when the file is new.
/// Returns the number of records written.
pub fn append_spans(path: &Path, spans: &[Span]) -> Result<usize, SpillError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        file.write_all(&SPILL_MAGIC)?;
        file.write_all(&SPILL_VERSION.to_le_bytes())?;
    }

    for span in spans {
        let encoded = encode_span(span).map_err(|e| SpillError::Codec(e.to_string()))?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
    }
    file.sync_all()?;
    Ok(spans.len())
}

/// Read every span out of a spill file.
pub fn read_spans(path: &Path) -> Result<Vec<Span>, SpillError> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    let mut version = [0u8; 4];
    file.read_exact(&mut version)?;
    if magic != SPILL_MAGIC || u32::from_le_bytes(version) != SPILL_VERSION {
        return Err(SpillError::BadHeader);
    }

    let mut spans = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut record = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        file.read_exact(&mut record)?;
        spans.push(decode_span(&record).map_err(|e| SpillError::Codec(e.to_string()))?);
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agentsight_contracts::SpanStatus;

    use super::*;

    fn span(id: &str) -> Span {
        Span {
            span_id: id.to_string(),
            trace_id: "t1".to_string(),
            parent_span_id: None,
            project_id: "p1".to_string(),
            name: "llm.chat".to_string(),
            service_name: "default".to_string(),
            status: SpanStatus::Ok,
            start_time: 1,
            end_time: 2,
            duration_ms: 0.0,
            attributes: HashMap::new(),
            events: vec![],
        }
    }

    #[test]
    fn test_spill_appends_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.bin");

        append_spans(&path, &[span("a"), span("b")]).unwrap();
        append_spans(&path, &[span("c")]).unwrap();

        let spans = read_spans(&path).unwrap();
        let ids: Vec<_> = spans.iter().map(|s| s.span_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_spill_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.bin");
        append_spans(&path, &[span("a")]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"AGSP");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"JUNKxxxxmore").unwrap();
        assert!(matches!(read_spans(&path), Err(SpillError::BadHeader)));
    }
}
