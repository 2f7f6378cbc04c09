// Hierarchical address codec for CLI commands.
//
// Two generations of addressing share one wire grammar:
//
//   flat:    "<index> <COMMAND> <arg> ..."            (module, port)
//   indexed: "<m>/<p> <COMMAND> [<s>] <arg> ..."      (stream, tpld, ...)
//   nested:  "<m>/<p> <COMMAND> [<s>,<i>] <arg> ..."  (stream modifier)
//
// The variant is picked once from the number of index segments when
// the owning resource is constructed; everything above stays
// addressing-agnostic. Replies echo the same prefix with the command
// upper-cased, and `extract_value` strips it back out.

use crate::error::Error;

/// Address of one chassis resource, selected by index segment count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// One or two segments: the whole index is the command prefix.
    Flat { index: String },
    /// Three segments: module/port plus a bracketed sub-index.
    Indexed { module: u32, port: u32, sub: u32 },
    /// Four segments: module/port plus a two-level bracketed index.
    Nested {
        module: u32,
        port: u32,
        sub: u32,
        inner: u32,
    },
}

impl ResourceAddress {
    /// Parse a `/`-separated index. Every segment must be numeric.
    pub fn from_index(index: &str) -> Result<Self, Error> {
        let segments: Vec<u32> = index
            .split('/')
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| Error::BadIndex {
                index: index.to_owned(),
            })?;

        match segments[..] {
            [_] | [_, _] => Ok(Self::Flat {
                index: index.to_owned(),
            }),
            [module, port, sub] => Ok(Self::Indexed { module, port, sub }),
            [module, port, sub, inner] => Ok(Self::Nested {
                module,
                port,
                sub,
                inner,
            }),
            _ => Err(Error::BadIndex {
                index: index.to_owned(),
            }),
        }
    }

    /// The canonical `/`-separated index string.
    pub fn index(&self) -> String {
        match self {
            Self::Flat { index } => index.clone(),
            Self::Indexed { module, port, sub } => format!("{module}/{port}/{sub}"),
            Self::Nested {
                module,
                port,
                sub,
                inner,
            } => format!("{module}/{port}/{sub}/{inner}"),
        }
    }

    /// Last index segment, the resource's id within its parent.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Flat { index } => index.rsplit('/').next().and_then(|s| s.parse().ok()),
            Self::Indexed { sub, .. } => Some(*sub),
            Self::Nested { inner, .. } => Some(*inner),
        }
    }

    /// Build the full command line for this resource.
    pub fn build_command(&self, command: &str, args: &[&str]) -> String {
        let mut line = match self {
            Self::Flat { index } => format!("{index} {command}"),
            Self::Indexed { module, port, sub } => {
                format!("{module}/{port} {command} [{sub}]")
            }
            Self::Nested {
                module,
                port,
                sub,
                inner,
            } => format!("{module}/{port} {command} [{sub},{inner}]"),
        };
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Strip the echoed address prefix from a reply, returning the
    /// value tail. The command echo is matched case-insensitively
    /// (the chassis upper-cases it). `None` when the reply does not
    /// carry the expected prefix; the caller decides how to fall
    /// back, since some replies legitimately omit the echo.
    pub fn extract_value<'a>(&self, command: &str, reply: &'a str) -> Option<&'a str> {
        let rest = reply.trim_start();
        let rest = match self {
            Self::Flat { index } => {
                let rest = rest.strip_prefix(index.as_str())?;
                strip_token_ci(rest.trim_start(), command)?
            }
            Self::Indexed { module, port, sub } => {
                let rest = rest.strip_prefix(&format!("{module}/{port}"))?;
                let rest = strip_token_ci(rest.trim_start(), command)?;
                rest.trim_start().strip_prefix(&format!("[{sub}]"))?
            }
            Self::Nested {
                module,
                port,
                sub,
                inner,
            } => {
                let rest = rest.strip_prefix(&format!("{module}/{port}"))?;
                let rest = strip_token_ci(rest.trim_start(), command)?;
                rest.trim_start().strip_prefix(&format!("[{sub},{inner}]"))?
            }
        };
        Some(rest.trim_start())
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.index())
    }
}

/// Case-insensitive literal prefix strip.
fn strip_token_ci<'a>(s: &'a str, token: &str) -> Option<&'a str> {
    let head = s.get(..token.len())?;
    if head.eq_ignore_ascii_case(token) {
        s.get(token.len()..)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn variant_selection_by_segment_count() {
        assert!(matches!(
            ResourceAddress::from_index("7").unwrap(),
            ResourceAddress::Flat { .. }
        ));
        assert!(matches!(
            ResourceAddress::from_index("0/1").unwrap(),
            ResourceAddress::Flat { .. }
        ));
        assert!(matches!(
            ResourceAddress::from_index("0/1/2").unwrap(),
            ResourceAddress::Indexed { .. }
        ));
        assert!(matches!(
            ResourceAddress::from_index("0/1/2/3").unwrap(),
            ResourceAddress::Nested { .. }
        ));
        assert!(ResourceAddress::from_index("0/x").is_err());
        assert!(ResourceAddress::from_index("0/1/2/3/4").is_err());
    }

    #[test]
    fn flat_build_and_extract_round_trip() {
        let addr = ResourceAddress::from_index("0/1").unwrap();
        let line = addr.build_command("p_comment", &["\"dut port\""]);
        assert_eq!(line, "0/1 p_comment \"dut port\"");

        // The chassis echoes the command upper-cased.
        let reply = "0/1  P_COMMENT  \"dut port\"";
        assert_eq!(addr.extract_value("p_comment", reply), Some("\"dut port\""));
    }

    #[test]
    fn indexed_build_and_extract_round_trip() {
        let addr = ResourceAddress::from_index("2/4/6").unwrap();
        let line = addr.build_command("ps_rate", &["1000", "pps"]);
        assert_eq!(line, "2/4 ps_rate [6] 1000 pps");

        let reply = "2/4  PS_RATE  [6]  1000 pps";
        assert_eq!(addr.extract_value("ps_rate", reply), Some("1000 pps"));
    }

    #[test]
    fn nested_build_and_extract_round_trip() {
        let addr = ResourceAddress::from_index("0/1/2/0").unwrap();
        let line = addr.build_command("ps_modifier", &["4", "0xFFFF0000", "INC", "1"]);
        assert_eq!(line, "0/1 ps_modifier [2,0] 4 0xFFFF0000 INC 1");

        let reply = "0/1 PS_MODIFIER [2,0] 4 0xFFFF0000 INC 1";
        assert_eq!(
            addr.extract_value("ps_modifier", reply),
            Some("4 0xFFFF0000 INC 1")
        );
    }

    #[test]
    fn extract_miss_returns_none() {
        let addr = ResourceAddress::from_index("0/1").unwrap();
        assert_eq!(addr.extract_value("p_receivesync", "IN_SYNC"), None);
        // Wrong sub-index on an indexed address is also a miss.
        let addr = ResourceAddress::from_index("0/1/2").unwrap();
        assert_eq!(addr.extract_value("ps_rate", "0/1 PS_RATE [3] 10"), None);
    }

    #[test]
    fn id_is_last_numeric_segment() {
        assert_eq!(ResourceAddress::from_index("0/1").unwrap().id(), Some(1));
        assert_eq!(ResourceAddress::from_index("0/1/9").unwrap().id(), Some(9));
        assert_eq!(
            ResourceAddress::from_index("0/1/9/3").unwrap().id(),
            Some(3)
        );
    }
}
