use anyhow::{anyhow, Result};

/// Comma-separated port matcher: each token is a single port or an
/// inclusive `low-high` range.
#[derive(Clone, Debug, Default)]
pub struct PortSpec {
    ranges: Vec<(u16, u16)>,
}

impl PortSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some((low, high)) = token.split_once('-') {
                let low: u16 = low
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid port range {}", token))?;
                let high: u16 = high
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid port range {}", token))?;
                if low > high {
                    return Err(anyhow!("invalid port range {}: low above high", token));
                }
                ranges.push((low, high));
            } else {
                let port: u16 = token
                    .parse()
                    .map_err(|_| anyhow!("invalid port {}", token))?;
                ranges.push((port, port));
            }
        }
        Ok(Self { ranges })
    }

    pub fn matches(&self, port: u16) -> bool {
        self.ranges
            .iter()
            .any(|(low, high)| port >= *low && port <= *high)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Export policy: deny is consulted first, then allow; an empty allow list
/// accepts everything the deny list lets through.
#[derive(Clone, Debug, Default)]
pub struct PortPolicy {
    allow: PortSpec,
    deny: PortSpec,
}

impl PortPolicy {
    pub fn from_specs(allow: &str, deny: &str) -> Result<Self> {
        Ok(Self {
            allow: PortSpec::parse(allow)?,
            deny: PortSpec::parse(deny)?,
        })
    }

    pub fn allows(&self, port: u16) -> bool {
        if self.deny.matches(port) {
            return false;
        }
        if !self.allow.is_empty() {
            return self.allow.matches(port);
        }
        true
    }
}
