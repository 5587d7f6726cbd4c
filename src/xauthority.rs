//! X authority file handling
//!
//! An .Xauthority file is a sequence of records, each a big-endian u16
//! family followed by four u16-length-prefixed fields: address, display
//! number, auth scheme name, auth data. The daemon merges one cookie per
//! session into the user's file and removes it again when the session
//! ends. Unrelated records (other displays, other hosts) are preserved.
//!
//! Callers are responsible for doing these writes with the user's
//! effective uid/gid; nothing here changes credentials.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::ipc::XauthRecord;

/// Address family for a local (hostname-addressed) display.
pub const FAMILY_LOCAL: u16 = 256;
/// Wildcard family matching any address.
pub const FAMILY_WILD: u16 = 65535;

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_field(buf: &mut Vec<u8>, field: &[u8]) {
    write_u16(buf, field.len() as u16);
    buf.extend_from_slice(field);
}

fn encode_record(record: &XauthRecord, buf: &mut Vec<u8>) {
    write_u16(buf, record.family);
    write_field(buf, &record.address);
    write_field(buf, record.number.as_bytes());
    write_field(buf, record.name.as_bytes());
    write_field(buf, &record.data);
}

struct RecordParser<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> RecordParser<'a> {
    fn read_u16(&mut self) -> Result<u16> {
        if self.bytes.len() - self.offset < 2 {
            bail!("truncated authority record at byte {}", self.offset);
        }
        let value = u16::from_be_bytes([self.bytes[self.offset], self.bytes[self.offset + 1]]);
        self.offset += 2;
        Ok(value)
    }

    fn read_field(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        if self.bytes.len() - self.offset < len {
            bail!("truncated authority field at byte {}", self.offset);
        }
        let field = self.bytes[self.offset..self.offset + len].to_vec();
        self.offset += len;
        Ok(field)
    }
}

/// Parse every record in an authority file image.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<XauthRecord>> {
    let mut parser = RecordParser { bytes, offset: 0 };
    let mut records = Vec::new();
    while parser.offset < bytes.len() {
        let family = parser.read_u16()?;
        let address = parser.read_field()?;
        let number = String::from_utf8_lossy(&parser.read_field()?).into_owned();
        let name = String::from_utf8_lossy(&parser.read_field()?).into_owned();
        let data = parser.read_field()?;
        records.push(XauthRecord {
            family,
            address,
            number,
            name,
            data,
        });
    }
    Ok(records)
}

/// Serialize records back to file form.
pub fn encode_records(records: &[XauthRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        encode_record(record, &mut buf);
    }
    buf
}

fn matches(a: &XauthRecord, b: &XauthRecord) -> bool {
    if a.number != b.number || a.name != b.name {
        return false;
    }
    // A wildcard record covers every family and address.
    if a.family == FAMILY_WILD || b.family == FAMILY_WILD {
        return true;
    }
    a.family == b.family && a.address == b.address
}

/// Merge `record` into the authority file at `path`, replacing any record
/// for the same display. A missing file is created; a corrupt one is
/// overwritten rather than propagated.
pub fn update_file(path: &Path, record: &XauthRecord) -> Result<()> {
    let mut records = match fs::read(path) {
        Ok(bytes) => parse_records(&bytes).unwrap_or_default(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    records.retain(|existing| !matches(existing, record));
    records.push(record.clone());
    fs::write(path, encode_records(&records))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Remove the record for this display from the file. The file is deleted
/// outright when no records remain.
pub fn remove_from_file(path: &Path, record: &XauthRecord) -> Result<()> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let mut records = parse_records(&bytes).unwrap_or_default();
    records.retain(|existing| !matches(existing, record));
    if records.is_empty() {
        fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
    } else {
        fs::write(path, encode_records(&records))
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(number: &str, data: u8) -> XauthRecord {
        XauthRecord {
            family: FAMILY_LOCAL,
            address: b"testhost".to_vec(),
            number: number.to_string(),
            name: "MIT-MAGIC-COOKIE-1".to_string(),
            data: vec![data; 16],
        }
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let records = vec![cookie("0", 0xaa), cookie("1", 0xbb)];
        let parsed = parse_records(&encode_records(&records)).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_truncated_file_is_error() {
        let bytes = encode_records(&[cookie("0", 0xaa)]);
        assert!(parse_records(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_update_replaces_same_display() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Xauthority");

        update_file(&path, &cookie("0", 0xaa)).unwrap();
        update_file(&path, &cookie("1", 0xbb)).unwrap();
        // New cookie for display 0 replaces the old one, display 1 survives
        update_file(&path, &cookie("0", 0xcc)).unwrap();

        let records = parse_records(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].number, "1");
        assert_eq!(records[1].data, vec![0xcc; 16]);
    }

    #[test]
    fn test_wildcard_record_matches_any_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Xauthority");

        let wild = XauthRecord {
            family: FAMILY_WILD,
            address: Vec::new(),
            ..cookie("0", 0xaa)
        };
        update_file(&path, &wild).unwrap();
        update_file(&path, &cookie("0", 0xbb)).unwrap();

        let records = parse_records(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].family, FAMILY_LOCAL);
    }

    #[test]
    fn test_remove_last_record_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Xauthority");

        update_file(&path, &cookie("0", 0xaa)).unwrap();
        remove_from_file(&path, &cookie("0", 0xaa)).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_from_file(&dir.path().join("none"), &cookie("0", 0xaa)).unwrap();
    }
}
