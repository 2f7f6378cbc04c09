// ── Resource node ──
//
// Base abstraction for every addressable chassis entity. A node is
// the address codec plus the shared connection plus identity
// (index, object reference, name). Port, stream, filter, tpld,
// capture and modifier all compose one of these and speak to the
// device exclusively through it.

use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use valkyrie_api::{ResourceAddress, SharedConnection};

use crate::error::CoreError;

/// One addressable entity on the chassis.
#[derive(Debug)]
pub struct ResourceNode {
    conn: SharedConnection,
    address: ResourceAddress,
    index: String,
    obj_ref: String,
    name: String,
}

impl ResourceNode {
    /// Build a node for `index` (hierarchical, `/`-separated, numeric
    /// segments). The addressing variant is selected here, once, from
    /// the segment count.
    pub fn new(
        conn: SharedConnection,
        index: &str,
        obj_ref: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let address = ResourceAddress::from_index(index)?;
        Ok(Self {
            conn,
            address,
            index: index.to_owned(),
            obj_ref: obj_ref.into(),
            name: index.to_owned(),
        })
    }

    /// Globally unique path of this object within the hierarchy.
    pub fn obj_ref(&self) -> &str {
        &self.obj_ref
    }

    /// Hierarchical index string, e.g. `"1/2/3"`.
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Last `/`-delimited segment of the index.
    pub fn id(&self) -> Option<u32> {
        self.address.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    // ── Command execution ────────────────────────────────────────────

    /// Send a command with no output; the chassis must answer `<OK>`.
    pub async fn send_command(&self, command: &str, args: &[&str]) -> Result<(), CoreError> {
        let line = self.address.build_command(command, args);
        self.conn.lock().await.query_ok(&line).await?;
        Ok(())
    }

    /// Send a command and return its single-line value, with the
    /// echoed address prefix stripped.
    pub async fn send_command_return(
        &self,
        command: &str,
        args: &[&str],
    ) -> Result<String, CoreError> {
        let line = self.address.build_command(command, args);
        let reply = self.conn.lock().await.query(&line).await?;
        Ok(self.extract(command, &reply))
    }

    /// Send a command and collect its multi-line reply.
    pub async fn send_command_return_multiline(
        &self,
        command: &str,
        args: &[&str],
    ) -> Result<Vec<String>, CoreError> {
        let line = self.address.build_command(command, args);
        let lines = self.conn.lock().await.query_multiline(&line).await?;
        Ok(lines)
    }

    // ── Attributes ───────────────────────────────────────────────────

    /// Query one attribute. The value is the raw device-formatted
    /// string; no type coercion happens at this layer.
    pub async fn get_attribute(&self, attribute: &str) -> Result<String, CoreError> {
        self.send_command_return(attribute, &["?"]).await
    }

    /// Set one attribute (one round trip).
    pub async fn set_attribute(&self, attribute: &str, value: &str) -> Result<(), CoreError> {
        self.send_command(attribute, &[value]).await
    }

    /// Set several attributes. Each is an independent round trip;
    /// there is no atomicity across the set.
    pub async fn set_attributes(&self, attributes: &[(&str, &str)]) -> Result<(), CoreError> {
        for (attribute, value) in attributes {
            self.set_attribute(attribute, value).await?;
        }
        Ok(())
    }

    /// Dump all attributes reported by the given info/config commands
    /// into one ordered `attribute -> value` map.
    pub async fn get_attributes(
        &self,
        info_commands: &[&str],
    ) -> Result<IndexMap<String, String>, CoreError> {
        let mut attributes = IndexMap::new();
        for command in info_commands {
            for line in self.send_command_return_multiline(command, &["?"]).await? {
                if let Some((attribute, value)) = split_attribute_line(&line) {
                    attributes.insert(attribute.to_ascii_lowercase(), value.to_owned());
                }
            }
        }
        Ok(attributes)
    }

    // ── State polling ────────────────────────────────────────────────

    /// Poll `attribute` once per second until its value matches one of
    /// `states` (case-insensitively) or `timeout_secs` whole seconds
    /// elapse. The attribute is observed exactly `timeout_secs` times
    /// before the timeout error is raised; no push notifications exist
    /// in this protocol.
    pub async fn wait_for_states(
        &self,
        attribute: &str,
        timeout_secs: u64,
        states: &[&str],
    ) -> Result<(), CoreError> {
        let mut last = String::new();
        for _ in 0..timeout_secs {
            last = self.get_attribute(attribute).await?;
            let observed = last.trim();
            if states.iter().any(|s| s.eq_ignore_ascii_case(observed)) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(CoreError::StateTimeout {
            attribute: attribute.to_owned(),
            expected: states.iter().map(|s| (*s).to_owned()).collect(),
            last,
            elapsed_secs: timeout_secs,
        })
    }

    // ── Statistics ───────────────────────────────────────────────────

    /// Query one statistics group and label its counters positionally
    /// with `captions`.
    pub async fn read_stat(
        &self,
        captions: &[&str],
        stat_name: &str,
    ) -> Result<IndexMap<String, i64>, CoreError> {
        let reply = self.get_attribute(stat_name).await?;
        zip_stat_counters(captions, &reply).map_err(|_| CoreError::BadReply {
            command: stat_name.to_owned(),
            reply,
        })
    }

    fn extract(&self, command: &str, reply: &str) -> String {
        match self.address.extract_value(command, reply) {
            Some(value) => value.trim_end().to_owned(),
            None => {
                // Some replies legitimately omit the echoed prefix, so
                // the raw line is returned; the counter makes a
                // mismatch storm visible.
                self.conn.stats().note_prefix_fallback();
                debug!(command, reply, "reply without address prefix, returning raw");
                reply.trim().to_owned()
            }
        }
    }
}

/// Zip a caption list positionally against a space-separated counter
/// reply. A length mismatch truncates to the shorter of the two
/// sides; a non-numeric counter token is an error.
pub fn zip_stat_counters(
    captions: &[&str],
    reply: &str,
) -> Result<IndexMap<String, i64>, std::num::ParseIntError> {
    captions
        .iter()
        .zip(reply.split_whitespace())
        .map(|(caption, token)| Ok(((*caption).to_owned(), token.parse()?)))
        .collect()
}

/// Split one `"<address> <ATTRIBUTE> <value>"` dump line.
fn split_attribute_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start();
    let (_, rest) = rest.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    let (attribute, value) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));
    Some((attribute, value.trim()))
}

/// Strip the surrounding quotes of a device comment value.
pub(crate) fn unquote(value: &str) -> &str {
    value
        .trim()
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or_else(|| value.trim())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn stat_zip_labels_counters_in_order() {
        let stats = zip_stat_counters(&["bps", "pps", "bytes", "packets"], "100 10 5000 50")
            .unwrap();
        assert_eq!(
            stats.into_iter().collect::<Vec<_>>(),
            vec![
                ("bps".to_owned(), 100),
                ("pps".to_owned(), 10),
                ("bytes".to_owned(), 5000),
                ("packets".to_owned(), 50),
            ]
        );
    }

    #[test]
    fn stat_zip_truncates_to_shorter_side() {
        // More captions than counters.
        let stats = zip_stat_counters(&["bps", "pps", "bytes", "packets"], "100 10 5000").unwrap();
        assert_eq!(stats.len(), 3);
        assert!(!stats.contains_key("packets"));

        // More counters than captions.
        let stats = zip_stat_counters(&["bps", "pps"], "100 10 5000 50").unwrap();
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn stat_zip_rejects_non_numeric_counters() {
        assert!(zip_stat_counters(&["bps"], "lots").is_err());
    }

    #[test]
    fn attribute_dump_line_split() {
        assert_eq!(
            split_attribute_line("0/1  P_COMMENT  \"dut port\""),
            Some(("P_COMMENT", "\"dut port\""))
        );
        assert_eq!(
            split_attribute_line("0/1 P_RECEIVESYNC IN_SYNC"),
            Some(("P_RECEIVESYNC", "IN_SYNC"))
        );
        assert_eq!(split_attribute_line("orphan"), None);
    }

    #[test]
    fn unquote_strips_balanced_quotes_only() {
        assert_eq!(unquote("\"first stream\""), "first stream");
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote("\"unbalanced"), "\"unbalanced");
    }
}
