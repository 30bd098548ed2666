//! Memcached sink for collected stats.
//!
//! Speaks the memcached text protocol directly over a TCP stream.  Each
//! share is stored under a well-known index so downstream consumers can
//! fetch it by share ID.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::errors::StatsError;
use crate::share::StorageShare;

/// Field separator inside a cached record.
const FIELD_SEPARATOR: &str = "%%";

/// Cache index for a share's stats record.
pub fn index_for(share_id: &str) -> String {
    format!("Ugrstoragestats_{share_id}")
}

/// Serialize a share's stats into the cached record format:
/// `id%%protocol%%timestamp%%quota%%bytesused%%bytesfree%%status`.
pub fn storage_stats_record(share: &StorageShare) -> String {
    [
        share.id.as_str(),
        share.storageprotocol.as_str(),
        &share.stats.endtime.to_string(),
        &share.stats.quota.to_string(),
        &share.stats.bytesused.to_string(),
        &share.stats.bytesfree.to_string(),
        share.status.as_str(),
    ]
    .join(FIELD_SEPARATOR)
}

fn connection_error(detail: impl std::fmt::Display) -> StatsError {
    StatsError::MemcachedConnection {
        debug: detail.to_string(),
    }
}

/// Store `data` under `index`. An unacknowledged write is an error.
pub async fn set(addr: &str, index: &str, data: &str) -> Result<(), StatsError> {
    let mut stream = TcpStream::connect(addr).await.map_err(connection_error)?;

    let command = format!("set {index} 0 0 {}\r\n{data}\r\n", data.len());
    stream
        .write_all(command.as_bytes())
        .await
        .map_err(connection_error)?;

    let reply = read_reply(&mut stream).await?;
    if reply.trim_end() != "STORED" {
        return Err(connection_error(format!("unexpected reply: {reply:?}")));
    }
    Ok(())
}

/// Fetch the record stored under `index`.
pub async fn get(addr: &str, index: &str) -> Result<String, StatsError> {
    let mut stream = TcpStream::connect(addr).await.map_err(connection_error)?;

    stream
        .write_all(format!("get {index}\r\n").as_bytes())
        .await
        .map_err(connection_error)?;

    let reply = read_reply(&mut stream).await?;

    // Reply shape: "VALUE <index> <flags> <bytes>\r\n<data>\r\nEND\r\n",
    // or a bare "END\r\n" when the index is absent.
    let mut lines = reply.lines();
    match lines.next() {
        Some(header) if header.starts_with("VALUE ") => lines
            .next()
            .map(str::to_string)
            .ok_or_else(|| connection_error("truncated VALUE reply")),
        _ => Err(StatsError::MemcachedIndex {
            index: index.to_string(),
        }),
    }
}

/// Read until the terminating line of a memcached text reply.
async fn read_reply(stream: &mut TcpStream) -> Result<String, StatsError> {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();

    loop {
        let mut chunk = [0u8; 1024];
        let n = reader.read(&mut chunk).await.map_err(connection_error)?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buffer);
        if text.ends_with("\r\n")
            && (text.contains("END\r\n")
                || text.starts_with("STORED")
                || text.starts_with("NOT_STORED")
                || text.starts_with("ERROR"))
        {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
