//! XML helpers: DAV request/response handling and StAR record rendering.
//!
//! All XML in and out of this crate goes through `quick-xml`.  The DAV
//! side covers the RFC4331 PROPFIND body and the two response shapes the
//! DAV collector consumes; the StAR side renders the accounting document
//! consumed by downstream reporting.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::errors::StatsError;
use crate::share::{QuotaSetting, StorageEndpoint, StorageShare};

/// StAR storage record namespace.
const SR_NAMESPACE: &str = "http://eu-emi.eu/namespaces/2011/02/storagerecord";

// ── RFC4331 request ─────────────────────────────────────────────────

/// Build the PROPFIND body asking a DAV endpoint for its quota properties.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <propfind xmlns="DAV:">
///   <prop>
///     <quota-available-bytes/>
///     <quota-used-bytes/>
///   </prop>
/// </propfind>
/// ```
pub fn create_rfc4331_request() -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");

    let root = BytesStart::new("propfind").with_attributes([("xmlns", "DAV:")]);
    writer.write_event(Event::Start(root)).expect("start propfind");
    writer
        .write_event(Event::Start(BytesStart::new("prop")))
        .expect("start prop");
    writer
        .write_event(Event::Empty(BytesStart::new("quota-available-bytes")))
        .expect("quota-available-bytes");
    writer
        .write_event(Event::Empty(BytesStart::new("quota-used-bytes")))
        .expect("quota-used-bytes");
    writer
        .write_event(Event::End(BytesEnd::new("prop")))
        .expect("end prop");
    writer
        .write_event(Event::End(BytesEnd::new("propfind")))
        .expect("end propfind");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// ── DAV response parsing ────────────────────────────────────────────

fn malformed_xml(err: impl std::fmt::Display) -> StatsError {
    StatsError::Connection {
        error: "MalformedXML".to_string(),
        status_code: "000".to_string(),
        debug: err.to_string(),
    }
}

/// Sum the `getcontentlength` property across all entries of a
/// depth-infinity PROPFIND listing.
///
/// Returns total bytes and the number of entries carrying that property.
pub fn sum_getcontentlength(body: &str) -> Result<(u64, u64), StatsError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut bytesused: u64 = 0;
    let mut filecount: u64 = 0;
    let mut in_length = false;

    loop {
        match reader.read_event().map_err(malformed_xml)? {
            Event::Start(e) => {
                in_length = e.local_name().as_ref() == b"getcontentlength";
            }
            Event::Text(t) if in_length => {
                let text = t.unescape().map_err(malformed_xml)?;
                if let Ok(size) = text.trim().parse::<u64>() {
                    bytesused += size;
                    filecount += 1;
                }
            }
            Event::End(_) => in_length = false,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok((bytesused, filecount))
}

/// Extract the text of the first element with the given DAV local name.
fn find_dav_property(body: &str, property: &[u8]) -> Result<Option<u64>, StatsError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut in_property = false;

    loop {
        match reader.read_event().map_err(malformed_xml)? {
            Event::Start(e) => {
                in_property = e.local_name().as_ref() == property;
            }
            Event::Text(t) if in_property => {
                let text = t.unescape().map_err(malformed_xml)?;
                if let Ok(value) = text.trim().parse::<u64>() {
                    return Ok(Some(value));
                }
            }
            Event::End(_) => in_property = false,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(None)
}

/// Apply an RFC4331 PROPFIND response onto the share's stats block.
///
/// Missing quota properties mean the endpoint does not support the
/// method.  With an API-derived quota, `quota = bytesused + bytesfree`
/// unless the endpoint reports exactly zero bytes free: that is
/// ambiguous (no quota configured, or genuinely full), so the quota is
/// left at its previous value and a warning is surfaced.
pub fn process_rfc4331_response(
    body: &str,
    share: &mut StorageShare,
) -> Result<(), StatsError> {
    let bytesfree = find_dav_property(body, b"quota-available-bytes")?;
    let bytesused = find_dav_property(body, b"quota-used-bytes")?;

    let (bytesfree, bytesused) = match (bytesfree, bytesused) {
        (Some(free), Some(used)) => (free, used),
        _ => {
            return Err(StatsError::DavQuotaMethod {
                debug: body.to_string(),
            })
        }
    };

    share.stats.bytesused = bytesused;
    share.stats.bytesfree = bytesfree;

    match share.quota_setting() {
        QuotaSetting::Api => {
            if bytesfree == 0 {
                return Err(StatsError::DavZeroQuotaWarning {
                    debug: body.to_string(),
                });
            }
            share.stats.quota = bytesused + bytesfree;
        }
        QuotaSetting::Bytes(quota) => {
            share.stats.quota = quota;
            share.stats.bytesfree = quota.saturating_sub(bytesused);
        }
    }

    Ok(())
}

// ── StAR accounting records ─────────────────────────────────────────

fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .expect("start element");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("element text");
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .expect("end element");
}

fn format_timestamp(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

/// Render the StAR accounting document: one `StorageUsageRecord` per
/// share across all endpoints.
pub fn format_star(storage_endpoints: &[StorageEndpoint]) -> String {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");

    let root = BytesStart::new("sr:StorageUsageRecords")
        .with_attributes([("xmlns:sr", SR_NAMESPACE)]);
    writer.write_event(Event::Start(root)).expect("start root");

    for endpoint in storage_endpoints {
        for share in &endpoint.storage_shares {
            writer
                .write_event(Event::Start(BytesStart::new("sr:StorageUsageRecord")))
                .expect("start record");

            let record_id = format!("{}-{}", share.id, uuid::Uuid::new_v4());
            let create_time = format_timestamp(chrono::Utc::now().timestamp());
            let identity = BytesStart::new("sr:RecordIdentity").with_attributes([
                ("sr:createTime", create_time.as_str()),
                ("sr:recordId", record_id.as_str()),
            ]);
            writer
                .write_event(Event::Empty(identity))
                .expect("record identity");

            // StorageShare field (optional): bucket or container.
            if let Some(storage_share) = share.star_storage_share() {
                write_text_element(&mut writer, "sr:StorageShare", storage_share);
            }

            // StorageSystem field (required).
            if !share.uri.hostname.is_empty() {
                write_text_element(&mut writer, "sr:StorageSystem", &share.uri.hostname);
            }

            write_text_element(
                &mut writer,
                "sr:StartTime",
                &format_timestamp(share.stats.starttime),
            );
            write_text_element(
                &mut writer,
                "sr:EndTime",
                &format_timestamp(share.stats.endtime),
            );

            // FileCount field (optional).
            if share.stats.filecount > 0 {
                write_text_element(
                    &mut writer,
                    "sr:FileCount",
                    &share.stats.filecount.to_string(),
                );
            }

            write_text_element(
                &mut writer,
                "sr:ResourceCapacityUsed",
                &share.stats.bytesused.to_string(),
            );
            write_text_element(
                &mut writer,
                "sr:ResourceCapacityAllocated",
                &share.stats.quota.to_string(),
            );

            writer
                .write_event(Event::End(BytesEnd::new("sr:StorageUsageRecord")))
                .expect("end record");
        }
    }

    writer
        .write_event(Event::End(BytesEnd::new("sr:StorageUsageRecords")))
        .expect("end root");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}
