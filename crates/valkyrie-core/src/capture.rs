// ── Capture buffer ──
//
// Inspection of captured packets on a port (`pc_*` command group).
// Packets come off the chassis as `0x`-prefixed hex blobs; the text
// form re-renders them as an offset-prefixed hex dump that text2pcap
// understands.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use valkyrie_api::SharedConnection;

use crate::error::CoreError;
use crate::object::ResourceNode;
use crate::tshark::Tshark;

/// Caption labels for the `pc_stats` counter group.
pub const CAPTURE_STATS_CAPTIONS: &[&str] = &["status", "packets", "starttime"];

/// Output form of [`Capture::get_packets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBufferType {
    /// Bare hex strings as read from the device.
    Raw,
    /// Hex dump with byte offsets, one packet per block.
    Text,
    /// A pcap file produced by text2pcap. Requires a target file.
    Pcap,
}

/// A port's capture buffer.
#[derive(Debug)]
pub struct Capture {
    node: ResourceNode,
    packets: BTreeMap<u32, CapturePacket>,
}

impl Capture {
    pub(crate) fn new(
        conn: SharedConnection,
        port_index: &str,
        port_ref: &str,
    ) -> Result<Self, CoreError> {
        let node = ResourceNode::new(conn, port_index, format!("{port_ref}/capture"))?;
        Ok(Self {
            node,
            packets: BTreeMap::new(),
        })
    }

    /// Capture status counters (`pc_stats`).
    pub async fn read_stats(&self) -> Result<IndexMap<String, i64>, CoreError> {
        self.node.read_stat(CAPTURE_STATS_CAPTIONS, "pc_stats").await
    }

    /// Cached packet handles. Populated by `ensure_packets`.
    pub fn packets(&self) -> &BTreeMap<u32, CapturePacket> {
        &self.packets
    }

    /// Build packet handles from the device-reported packet count if
    /// the cache is empty.
    pub async fn ensure_packets(&mut self) -> Result<&BTreeMap<u32, CapturePacket>, CoreError> {
        if self.packets.is_empty() {
            let stats = self.read_stats().await?;
            let count = stats.get("packets").copied().unwrap_or(0).max(0) as u32;
            for pid in 0..count {
                let index = format!("{}/{pid}", self.node.index());
                let packet = CapturePacket::new(
                    self.node.connection().clone(),
                    &index,
                    self.node.obj_ref(),
                )?;
                self.packets.insert(pid, packet);
            }
        }
        Ok(&self.packets)
    }

    /// Read packets `from_index..to_index` (to the end when
    /// `to_index` is `None`) and render them as `cap_type`.
    ///
    /// The rendered packets are returned and, when `file` is given,
    /// also written to it. The pcap form requires `file`; the hex-dump
    /// text goes through a sibling temp file that text2pcap converts,
    /// and the returned strings are that text dump.
    pub async fn get_packets(
        &mut self,
        from_index: u32,
        to_index: Option<u32>,
        cap_type: CaptureBufferType,
        file: Option<&Path>,
        tshark: Option<&Tshark>,
    ) -> Result<Vec<String>, CoreError> {
        self.ensure_packets().await?;
        let to_index = to_index.unwrap_or(self.packets.len() as u32);

        let mut raw_packets = Vec::new();
        for pid in from_index..to_index {
            let packet = self.packets.get(&pid).ok_or_else(|| CoreError::NotFound {
                entity: "packet",
                id: pid.to_string(),
            })?;
            raw_packets.push(packet.raw_payload().await?);
        }

        if cap_type == CaptureBufferType::Raw {
            save_packets(file, &raw_packets).await?;
            return Ok(raw_packets);
        }

        let text_packets: Vec<String> = raw_packets.iter().map(|p| format_hex_dump(p)).collect();

        if cap_type == CaptureBufferType::Text {
            save_packets(file, &text_packets).await?;
            return Ok(text_packets);
        }

        // Pcap: dump the text form next to the target and convert it.
        let pcap_file = file.ok_or_else(|| {
            CoreError::Internal("pcap capture requires a target file".to_owned())
        })?;
        let mut temp_file = pcap_file.as_os_str().to_owned();
        temp_file.push("_");
        let temp_file = PathBuf::from(temp_file);

        save_packets(Some(&temp_file), &text_packets).await?;
        let default_tshark;
        let tshark = match tshark {
            Some(tshark) => tshark,
            None => {
                default_tshark = Tshark::new(None);
                &default_tshark
            }
        };
        tshark.text_to_pcap(&temp_file, pcap_file).await?;
        tokio::fs::remove_file(&temp_file)
            .await
            .map_err(|source| CoreError::File {
                path: temp_file.display().to_string(),
                source,
            })?;

        Ok(text_packets)
    }
}

/// One captured packet.
#[derive(Debug)]
pub struct CapturePacket {
    node: ResourceNode,
}

impl CapturePacket {
    fn new(conn: SharedConnection, index: &str, parent_ref: &str) -> Result<Self, CoreError> {
        let id_segment = index.rsplit('/').next().unwrap_or(index);
        let node = ResourceNode::new(conn, index, format!("{parent_ref}/{id_segment}"))?;
        Ok(Self { node })
    }

    pub fn id(&self) -> u32 {
        self.node.id().unwrap_or_default()
    }

    /// The packet's hex payload with the `0x` marker stripped.
    pub async fn raw_payload(&self) -> Result<String, CoreError> {
        let reply = self.node.get_attribute("pc_packet").await?;
        match reply.split_once("0x") {
            Some((_, payload)) => Ok(payload.trim().to_owned()),
            None => Err(CoreError::BadReply {
                command: "pc_packet".to_owned(),
                reply,
            }),
        }
    }

    /// The payload decoded to bytes.
    pub async fn payload(&self) -> Result<Vec<u8>, CoreError> {
        let raw = self.raw_payload().await?;
        hex::decode(&raw).map_err(|_| CoreError::BadReply {
            command: "pc_packet".to_owned(),
            reply: raw,
        })
    }
}

/// Render one raw hex payload as an offset-prefixed dump, 16 bytes
/// per line, in the shape text2pcap expects:
///
/// ```text
/// 000000 ff ff ff ff ff ff 00 00 00 00 00 01 08 00 45 00
/// 000010 00 2a ...
/// ```
pub fn format_hex_dump(raw: &str) -> String {
    let mut out = String::new();
    for (i, c) in raw.chars().enumerate() {
        if i % 32 == 0 {
            out.push('\n');
            let _ = write!(out, "{:06x} ", i / 2);
        } else if i % 2 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

async fn save_packets(file: Option<&Path>, packets: &[String]) -> Result<(), CoreError> {
    if let Some(path) = file {
        let content = packets.concat();
        tokio::fs::write(path, content)
            .await
            .map_err(|source| CoreError::File {
                path: path.display().to_string(),
                source,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hex_dump_groups_bytes_and_offsets() {
        assert_eq!(format_hex_dump("aabbccdd"), "\n000000 aa bb cc dd");
    }

    #[test]
    fn hex_dump_wraps_at_sixteen_bytes() {
        // 18 bytes: 16 on the first line, 2 on the second.
        let raw: String = (0u8..18).map(|_| "ab").collect();
        let dump = format_hex_dump(&raw);
        let lines: Vec<&str> = dump.trim_start_matches('\n').split('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("000000 "));
        assert!(lines[1].starts_with("000010 "));
        assert_eq!(lines[0].split_whitespace().count(), 17);
        assert_eq!(lines[1].split_whitespace().count(), 3);
    }

    #[test]
    fn hex_dump_of_empty_payload_is_empty() {
        assert_eq!(format_hex_dump(""), "");
    }
}
