//! Node layout inside the coordination store
//!
//! ```text
//! /registry/{group}/command
//! /registry/{group}/service/{path}/server/{host:port}
//! /registry/{group}/service/{path}/unavailableServer/{host:port}
//! /registry/{group}/service/{path}/client/{host:port}
//! ```
//!
//! `/` inside a group or service path is escaped as `%2F`.

use registry_core::Url;

pub const ROOT: &str = "/registry";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Available,
    Unavailable,
    Client,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Available => "server",
            NodeType::Unavailable => "unavailableServer",
            NodeType::Client => "client",
        }
    }
}

fn escape(segment: &str) -> String {
    if segment.is_empty() {
        return "%2F".to_string();
    }
    segment.replace('/', "%2F")
}

pub fn group_path(url: &Url) -> String {
    format!("{}/{}", ROOT, escape(url.group()))
}

pub fn command_path(url: &Url) -> String {
    format!("{}/command", group_path(url))
}

pub fn service_path(url: &Url) -> String {
    format!("{}/service/{}", group_path(url), escape(url.path()))
}

pub fn node_type_path(url: &Url, node_type: NodeType) -> String {
    format!("{}/{}", service_path(url), node_type.as_str())
}

pub fn node_path(url: &Url, node_type: NodeType) -> String {
    format!("{}/{}", node_type_path(url, node_type), url.identity())
}

/// `host:port` child name back to its parts
pub fn parse_node_name(name: &str) -> Option<(&str, u16)> {
    let (host, port) = name.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let url = Url::parse("rpc://10.0.0.1:8000//v1/orders?group=g1").unwrap();
        assert_eq!(command_path(&url), "/registry/g1/command");
        assert_eq!(
            node_path(&url, NodeType::Available),
            "/registry/g1/service/%2Fv1%2Forders/server/10.0.0.1:8000"
        );
        assert_eq!(
            node_type_path(&url, NodeType::Unavailable),
            "/registry/g1/service/%2Fv1%2Forders/unavailableServer"
        );

        let plain = Url::parse("rpc://h:1/com.example.Orders").unwrap();
        assert_eq!(
            node_path(&plain, NodeType::Client),
            "/registry/default_rpc/service/com.example.Orders/client/h:1"
        );
    }

    #[test]
    fn test_node_names() {
        assert_eq!(parse_node_name("10.0.0.1:8000"), Some(("10.0.0.1", 8000)));
        assert_eq!(parse_node_name("10.0.0.1"), None);
        assert_eq!(parse_node_name(":80"), None);
        assert_eq!(parse_node_name("h:port"), None);
    }
}
