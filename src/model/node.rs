//! Node views

use crate::record::Record;

/// Read-only typed access to a node record
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    record: &'a Record,
}

impl<'a> NodeView<'a> {
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &'a Record {
        self.record
    }

    pub fn name(&self) -> Option<&'a str> {
        self.record.get_str("name")
    }

    pub fn node_type(&self) -> Option<&'a str> {
        self.record.get_str("type")
    }

    pub fn host(&self) -> Option<&'a str> {
        self.record.get_str("host")
    }

    pub fn reactive_port(&self) -> Option<u16> {
        self.record
            .get_int("reactive_port")
            .and_then(|p| u16::try_from(p).ok())
    }

    /// Falls back to the reactive port when no deploy port is given
    pub fn deploy_port(&self) -> Option<u16> {
        self.record
            .get_int("deploy_port")
            .and_then(|p| u16::try_from(p).ok())
            .or_else(|| self.reactive_port())
    }

    /// `host:reactive_port`
    pub fn reactive_address(&self) -> Option<String> {
        Some(format!("{}:{}", self.host()?, self.reactive_port()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports() {
        let rec = Record::new()
            .with("name", "n1")
            .with("host", "10.0.0.2")
            .with("reactive_port", 6000);
        let node = NodeView::new(&rec);
        assert_eq!(node.reactive_port(), Some(6000));
        assert_eq!(node.deploy_port(), Some(6000));
        assert_eq!(node.reactive_address().as_deref(), Some("10.0.0.2:6000"));

        let rec = rec.with("deploy_port", 6001);
        assert_eq!(NodeView::new(&rec).deploy_port(), Some(6001));
    }

    #[test]
    fn test_out_of_range_port_is_none() {
        let rec = Record::new().with("reactive_port", 70000);
        assert_eq!(NodeView::new(&rec).reactive_port(), None);
        assert_eq!(NodeView::new(&rec).reactive_address(), None);
    }
}
