// ── Streams and modifiers ──
//
// A stream is a per-port traffic definition (`ps_*` command group).
// Streams carry the tpld id used for payload tracking and own their
// header modifiers, which use the four-segment `[sid,mid]` addressing.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use valkyrie_api::SharedConnection;

use crate::error::CoreError;
use crate::object::ResourceNode;

/// Caption labels for the `pt_stream` counter group.
pub const STREAM_STATS_CAPTIONS: &[&str] = &["bps", "pps", "bytes", "packets"];

/// Stream scheduling state, as understood by `ps_enable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Enabled,
    Disabled,
    Suspended,
}

impl StreamState {
    pub fn as_attr(self) -> &'static str {
        match self {
            Self::Enabled => "ON",
            Self::Disabled => "OFF",
            Self::Suspended => "SUPPRESS",
        }
    }
}

/// Standard or extended modifier command group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKind {
    Standard,
    Extended,
}

impl ModifierKind {
    fn count_attribute(self) -> &'static str {
        match self {
            Self::Standard => "ps_modifiercount",
            Self::Extended => "ps_modifierextcount",
        }
    }

    fn modifier_attribute(self) -> &'static str {
        match self {
            Self::Standard => "ps_modifier",
            Self::Extended => "ps_modifierext",
        }
    }

    fn range_attribute(self) -> &'static str {
        match self {
            Self::Standard => "ps_modifierrange",
            Self::Extended => "ps_modifierextrange",
        }
    }
}

/// Field-mutation action applied per transmitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierAction {
    Increment,
    Decrement,
    Random,
}

impl ModifierAction {
    pub fn as_attr(self) -> &'static str {
        match self {
            Self::Increment => "INC",
            Self::Decrement => "DEC",
            Self::Random => "RANDOM",
        }
    }

    fn from_attr(value: &str) -> Option<Self> {
        match value {
            "INC" => Some(Self::Increment),
            "DEC" => Some(Self::Decrement),
            "RANDOM" => Some(Self::Random),
            _ => None,
        }
    }
}

/// Everything the chassis needs to program one modifier. The range
/// fields are ignored for [`ModifierAction::Random`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierSpec {
    /// Byte offset into the packet header.
    pub position: u32,
    /// Bit mask over the modified field, `0x`-prefixed hex.
    pub mask: String,
    pub action: ModifierAction,
    pub repeat: u32,
    pub min: u32,
    pub step: u32,
    pub max: u32,
}

impl Default for ModifierSpec {
    fn default() -> Self {
        Self {
            position: 0,
            mask: "0xFFFF0000".to_owned(),
            action: ModifierAction::Increment,
            repeat: 1,
            min: 0,
            step: 1,
            max: 0,
        }
    }
}

/// One header modifier, addressed as `m/p CMD [sid,mid]`.
#[derive(Debug)]
pub struct Modifier {
    node: ResourceNode,
    kind: ModifierKind,
    spec: ModifierSpec,
}

impl Modifier {
    fn new(
        conn: SharedConnection,
        index: &str,
        parent_ref: &str,
        kind: ModifierKind,
        spec: ModifierSpec,
    ) -> Result<Self, CoreError> {
        let id_segment = index.rsplit('/').next().unwrap_or(index);
        let node = ResourceNode::new(conn, index, format!("{parent_ref}/modifier/{id_segment}"))?;
        Ok(Self { node, kind, spec })
    }

    pub fn id(&self) -> u32 {
        self.node.id().unwrap_or_default()
    }

    pub fn spec(&self) -> &ModifierSpec {
        &self.spec
    }

    /// Program the device with the current spec.
    async fn apply(&self) -> Result<(), CoreError> {
        let spec = &self.spec;
        let value = format!(
            "{} {} {} {}",
            spec.position,
            spec.mask,
            spec.action.as_attr(),
            spec.repeat
        );
        self.node
            .set_attribute(self.kind.modifier_attribute(), &value)
            .await?;
        if spec.action != ModifierAction::Random {
            let range = format!("{} {} {}", spec.min, spec.step, spec.max);
            self.node
                .set_attribute(self.kind.range_attribute(), &range)
                .await?;
        }
        Ok(())
    }

    /// Re-read the spec from the device.
    pub async fn refresh(&mut self) -> Result<(), CoreError> {
        let attribute = self.kind.modifier_attribute();
        let reply = self.node.get_attribute(attribute).await?;
        let mut spec = parse_modifier(&reply).ok_or_else(|| CoreError::BadReply {
            command: attribute.to_owned(),
            reply: reply.clone(),
        })?;

        if spec.action != ModifierAction::Random {
            let attribute = self.kind.range_attribute();
            let reply = self.node.get_attribute(attribute).await?;
            let (min, step, max) = parse_range(&reply).ok_or_else(|| CoreError::BadReply {
                command: attribute.to_owned(),
                reply: reply.clone(),
            })?;
            spec.min = min;
            spec.step = step;
            spec.max = max;
        }

        self.spec = spec;
        Ok(())
    }
}

/// One traffic stream on a port.
#[derive(Debug)]
pub struct Stream {
    pub(crate) node: ResourceNode,
    modifiers: BTreeMap<u32, Modifier>,
    xmodifiers: BTreeMap<u32, Modifier>,
}

impl Stream {
    pub(crate) fn new(
        conn: SharedConnection,
        index: &str,
        parent_ref: &str,
    ) -> Result<Self, CoreError> {
        let id_segment = index.rsplit('/').next().unwrap_or(index);
        let node = ResourceNode::new(conn, index, format!("{parent_ref}/stream/{id_segment}"))?;
        Ok(Self {
            node,
            modifiers: BTreeMap::new(),
            xmodifiers: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.node.id().unwrap_or_default()
    }

    pub fn index(&self) -> &str {
        self.node.index()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn node(&self) -> &ResourceNode {
        &self.node
    }

    pub(crate) async fn create(&self) -> Result<(), CoreError> {
        self.node.send_command("ps_create", &[]).await
    }

    /// Delete the stream on the device. The owning port evicts it
    /// from its cache; the tpld id is never returned to the pool.
    pub async fn delete(&self) -> Result<(), CoreError> {
        self.node.send_command("ps_delete", &[]).await
    }

    pub async fn set_state(&self, state: StreamState) -> Result<(), CoreError> {
        self.node.set_attribute("ps_enable", state.as_attr()).await
    }

    /// Per-stream TX counters (`pt_stream`).
    pub async fn read_stats(&self) -> Result<IndexMap<String, i64>, CoreError> {
        self.node.read_stat(STREAM_STATS_CAPTIONS, "pt_stream").await
    }

    /// Current packet header bytes (`ps_packetheader`).
    pub async fn packet_header(&self) -> Result<Vec<u8>, CoreError> {
        let value = self.node.get_attribute("ps_packetheader").await?;
        let trimmed = value.trim();
        let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        hex::decode(hex_str).map_err(|_| CoreError::BadReply {
            command: "ps_packetheader".to_owned(),
            reply: value.clone(),
        })
    }

    pub async fn set_packet_header(&self, header: &[u8]) -> Result<(), CoreError> {
        let value = format!("0x{}", hex::encode(header));
        self.node.set_attribute("ps_packetheader", &value).await
    }

    // ── Modifiers ────────────────────────────────────────────────────

    /// Cached modifier collection. Populated by `ensure_modifiers`.
    pub fn modifiers(&self, kind: ModifierKind) -> &BTreeMap<u32, Modifier> {
        self.cache(kind)
    }

    /// Populate the modifier cache from the device if it is empty.
    /// A chassis without extended-modifier support rejects the count
    /// query; that is treated as an empty collection.
    pub async fn ensure_modifiers(
        &mut self,
        kind: ModifierKind,
    ) -> Result<&BTreeMap<u32, Modifier>, CoreError> {
        if self.cache(kind).is_empty() {
            let count = match self.node.get_attribute(kind.count_attribute()).await {
                Ok(value) => {
                    value
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| CoreError::BadReply {
                            command: kind.count_attribute().to_owned(),
                            reply: value.clone(),
                        })?
                }
                Err(CoreError::Rejected { .. }) if kind == ModifierKind::Extended => 0,
                Err(e) => return Err(e),
            };

            let mut discovered = Vec::with_capacity(count as usize);
            for mid in 0..count {
                let index = format!("{}/{mid}", self.node.index());
                let mut modifier = Modifier::new(
                    self.node.connection().clone(),
                    &index,
                    self.node.obj_ref(),
                    kind,
                    ModifierSpec::default(),
                )?;
                modifier.refresh().await?;
                discovered.push((mid, modifier));
            }
            self.cache_mut(kind).extend(discovered);
        }
        Ok(self.cache(kind))
    }

    /// Add a modifier. Creation over the CLI is a count bump followed
    /// by the spec write; the new modifier takes the next ordinal id.
    pub async fn add_modifier(
        &mut self,
        kind: ModifierKind,
        spec: ModifierSpec,
    ) -> Result<u32, CoreError> {
        self.ensure_modifiers(kind).await?;
        let mid = self.cache(kind).len() as u32;
        self.node
            .set_attribute(kind.count_attribute(), &(mid + 1).to_string())
            .await?;

        let index = format!("{}/{mid}", self.node.index());
        let modifier = Modifier::new(
            self.node.connection().clone(),
            &index,
            self.node.obj_ref(),
            kind,
            spec,
        )?;
        modifier.apply().await?;
        self.cache_mut(kind).insert(mid, modifier);
        Ok(mid)
    }

    /// Remove a modifier. Modifier ids are ordinals, so removal
    /// resets the device-side count and reprograms the survivors.
    pub async fn remove_modifier(&mut self, kind: ModifierKind, id: u32) -> Result<(), CoreError> {
        self.ensure_modifiers(kind).await?;
        if !self.cache(kind).contains_key(&id) {
            return Err(CoreError::NotFound {
                entity: "modifier",
                id: id.to_string(),
            });
        }

        let survivors: Vec<ModifierSpec> = self
            .cache(kind)
            .iter()
            .filter(|(mid, _)| **mid != id)
            .map(|(_, m)| m.spec.clone())
            .collect();

        self.node.set_attribute(kind.count_attribute(), "0").await?;
        self.cache_mut(kind).clear();
        for spec in survivors {
            self.add_modifier(kind, spec).await?;
        }
        Ok(())
    }

    fn cache(&self, kind: ModifierKind) -> &BTreeMap<u32, Modifier> {
        match kind {
            ModifierKind::Standard => &self.modifiers,
            ModifierKind::Extended => &self.xmodifiers,
        }
    }

    fn cache_mut(&mut self, kind: ModifierKind) -> &mut BTreeMap<u32, Modifier> {
        match kind {
            ModifierKind::Standard => &mut self.modifiers,
            ModifierKind::Extended => &mut self.xmodifiers,
        }
    }
}

fn parse_modifier(reply: &str) -> Option<ModifierSpec> {
    let mut tokens = reply.split_whitespace();
    let position = tokens.next()?.parse().ok()?;
    let mask = tokens.next()?.to_owned();
    let action = ModifierAction::from_attr(tokens.next()?)?;
    let repeat = tokens.next()?.parse().ok()?;
    Some(ModifierSpec {
        position,
        mask,
        action,
        repeat,
        min: 0,
        step: 1,
        max: 0,
    })
}

fn parse_range(reply: &str) -> Option<(u32, u32, u32)> {
    let mut tokens = reply.split_whitespace();
    let min = tokens.next()?.parse().ok()?;
    let step = tokens.next()?.parse().ok()?;
    let max = tokens.next()?.parse().ok()?;
    Some((min, step, max))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn stream_state_wire_values() {
        assert_eq!(StreamState::Enabled.as_attr(), "ON");
        assert_eq!(StreamState::Disabled.as_attr(), "OFF");
        assert_eq!(StreamState::Suspended.as_attr(), "SUPPRESS");
    }

    #[test]
    fn modifier_reply_parsing() {
        let spec = parse_modifier("4 0xFFFF0000 INC 1").unwrap();
        assert_eq!(spec.position, 4);
        assert_eq!(spec.mask, "0xFFFF0000");
        assert_eq!(spec.action, ModifierAction::Increment);
        assert_eq!(spec.repeat, 1);

        assert!(parse_modifier("4 0xFFFF0000 WOBBLE 1").is_none());
        assert_eq!(parse_range("0 1 65535"), Some((0, 1, 65535)));
    }
}
