//! TCP client for the management server's line-based protocol.
//!
//! Requests are a command line followed by `key: value` argument lines and
//! a terminating blank line; replies mirror the shape with a reply header
//! line. Only the handful of commands the reconciler needs are implemented.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

use crate::mgmapi::{ClusterStatus, MgmClient, MgmConnector, MgmError, NodeStatus};

/// Timeout applied to connect and to every request/reply round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts made to land on the desired management node when connecting
/// through a load balancer.
const MAX_CONNECT_ATTEMPTS: u32 = 8;

/// Connector producing [`MgmTcpClient`] sessions.
#[derive(Clone, Debug, Default)]
pub struct MgmTcpConnector;

#[async_trait]
impl MgmConnector for MgmTcpConnector {
    /// Connect to a management server and ensure the session terminates at
    /// the node with the desired id. A connectstring pointing at a load
    /// balancer may reach any member, so reconnect until the right one
    /// answers.
    async fn connect(
        &self,
        connectstring: &str,
        desired_node_id: i32,
    ) -> Result<Box<dyn MgmClient>, MgmError> {
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            let mut client = MgmTcpClient::connect(connectstring).await?;
            let node_id = client.connected_mgmd_node_id().await?;
            if node_id == desired_node_id {
                return Ok(Box::new(client));
            }

            debug!(
                connectstring,
                node_id, desired_node_id, attempt, "Connected to wrong management node, retrying"
            );
            let _ = client.end_session().await;
        }

        Err(MgmError::NodeUnreachable(desired_node_id))
    }
}

/// A connected management server session.
pub struct MgmTcpClient {
    stream: BufStream<TcpStream>,
}

impl MgmTcpClient {
    /// Open a TCP session to the given `host:port` connectstring.
    pub async fn connect(connectstring: &str) -> Result<Self, MgmError> {
        let stream = tokio::time::timeout(REQUEST_TIMEOUT, TcpStream::connect(connectstring))
            .await
            .map_err(|_| MgmError::Timeout)??;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: BufStream::new(stream),
        })
    }

    /// Node id of the management server this session is connected to.
    pub async fn connected_mgmd_node_id(&mut self) -> Result<i32, MgmError> {
        let reply = self
            .exchange("get mgmd nodeid", &[], "get mgmd nodeid reply")
            .await?;
        reply_value(&reply, "nodeid")
    }

    /// Send one request and read the matching reply into a key/value map.
    async fn exchange(
        &mut self,
        command: &str,
        args: &[(&str, String)],
        expected_reply: &str,
    ) -> Result<BTreeMap<String, String>, MgmError> {
        let mut request = String::new();
        request.push_str(command);
        request.push('\n');
        for (key, value) in args {
            request.push_str(&format!("{key}: {value}\n"));
        }
        request.push('\n');

        tokio::time::timeout(REQUEST_TIMEOUT, async {
            self.stream.write_all(request.as_bytes()).await?;
            self.stream.flush().await?;
            self.read_reply(expected_reply).await
        })
        .await
        .map_err(|_| MgmError::Timeout)?
    }

    /// Read a reply: a header line that must match, then `key: value` lines
    /// up to a blank line.
    async fn read_reply(
        &mut self,
        expected_reply: &str,
    ) -> Result<BTreeMap<String, String>, MgmError> {
        let header = loop {
            let line = self.read_line().await?;
            if !line.trim().is_empty() {
                break line;
            }
        };
        if header.trim() != expected_reply {
            return Err(MgmError::Protocol(format!(
                "expected reply {expected_reply:?}, got {:?}",
                header.trim()
            )));
        }

        let mut values = BTreeMap::new();
        loop {
            let line = self.read_line().await?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(MgmError::Protocol(format!("malformed reply line {line:?}")));
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(values)
    }

    async fn read_line(&mut self) -> Result<String, MgmError> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(MgmError::Protocol(
                "connection closed by management server".to_string(),
            ));
        }
        Ok(line)
    }
}

#[async_trait]
impl MgmClient for MgmTcpClient {
    async fn get_status(&mut self) -> Result<ClusterStatus, MgmError> {
        let reply = self.exchange("get status", &[], "node status").await?;
        parse_cluster_status(&reply)
    }

    async fn get_config_version(&mut self, node_id: Option<i32>) -> Result<u32, MgmError> {
        let args = match node_id {
            Some(id) => vec![("node", id.to_string())],
            None => Vec::new(),
        };
        let reply = self
            .exchange(
                "get config generation",
                &args,
                "get config generation reply",
            )
            .await?;
        reply_value(&reply, "generation")
    }

    async fn stop_nodes(&mut self, node_ids: &[i32]) -> Result<(), MgmError> {
        let nodes = node_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let args = [
            ("node", nodes),
            ("abort", "0".to_string()),
            ("force", "0".to_string()),
        ];
        let reply = self.exchange("stop v2", &args, "stop reply").await?;

        match reply.get("result").map(String::as_str) {
            Some("Ok") => Ok(()),
            Some(other) => Err(MgmError::Server(other.to_string())),
            None => Err(MgmError::Protocol("stop reply without result".to_string())),
        }
    }

    async fn end_session(&mut self) -> Result<(), MgmError> {
        self.exchange("end session", &[], "end session reply")
            .await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Parse the flattened `node.<id>.<field>` map of a status reply.
fn parse_cluster_status(reply: &BTreeMap<String, String>) -> Result<ClusterStatus, MgmError> {
    let node_count: usize = reply_value(reply, "nodes")?;

    let mut status = ClusterStatus::default();
    let mut node_ids: Vec<i32> = Vec::new();
    for key in reply.keys() {
        if let Some(rest) = key.strip_prefix("node.") {
            if let Some((id, field)) = rest.split_once('.') {
                if field == "type" {
                    node_ids.push(id.parse().map_err(|_| {
                        MgmError::Protocol(format!("invalid node id in key {key:?}"))
                    })?);
                }
            }
        }
    }

    if node_ids.len() != node_count {
        return Err(MgmError::Protocol(format!(
            "status reply announced {node_count} nodes but described {}",
            node_ids.len()
        )));
    }

    for node_id in node_ids {
        let field = |name: &str| {
            reply
                .get(&format!("node.{node_id}.{name}"))
                .cloned()
                .ok_or_else(|| MgmError::Protocol(format!("node {node_id} misses {name}")))
        };

        let role = field("type")?.parse()?;
        let node_status = field("status")?;
        let node_group = field("node_group")
            .unwrap_or_else(|_| "-1".to_string())
            .parse()
            .unwrap_or(-1);

        status.insert(NodeStatus {
            node_id,
            role,
            node_group,
            connected: !matches!(node_status.as_str(), "NO_CONTACT" | "UNKNOWN"),
        });
    }

    Ok(status)
}

/// Parse a single typed value out of a reply map.
fn reply_value<T: std::str::FromStr>(
    reply: &BTreeMap<String, String>,
    key: &str,
) -> Result<T, MgmError> {
    let value = reply
        .get(key)
        .ok_or_else(|| MgmError::Protocol(format!("reply misses {key:?}")))?;
    value
        .parse()
        .map_err(|_| MgmError::Protocol(format!("invalid value for {key:?}: {value:?}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::mgmapi::NodeRole;

    fn status_reply(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_cluster_status() {
        let reply = status_reply(&[
            ("nodes", "4"),
            ("node.1.type", "MGM"),
            ("node.1.status", "CONNECTED"),
            ("node.2.type", "NDB"),
            ("node.2.status", "STARTED"),
            ("node.2.node_group", "0"),
            ("node.3.type", "NDB"),
            ("node.3.status", "NO_CONTACT"),
            ("node.3.node_group", "0"),
            ("node.129.type", "API"),
            ("node.129.status", "CONNECTED"),
        ]);

        let status = parse_cluster_status(&reply).unwrap();
        assert!(status.get(1).unwrap().connected);
        assert_eq!(status.get(1).unwrap().role, NodeRole::Mgm);
        assert!(status.get(2).unwrap().connected);
        assert_eq!(status.get(2).unwrap().node_group, 0);
        assert!(!status.get(3).unwrap().connected);
        assert_eq!(status.get(129).unwrap().role, NodeRole::Api);
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_parse_cluster_status_count_mismatch() {
        let reply = status_reply(&[
            ("nodes", "2"),
            ("node.1.type", "MGM"),
            ("node.1.status", "CONNECTED"),
        ]);
        assert!(matches!(
            parse_cluster_status(&reply),
            Err(MgmError::Protocol(_))
        ));
    }

    #[test]
    fn test_reply_value() {
        let reply = status_reply(&[("generation", "7")]);
        let generation: u32 = reply_value(&reply, "generation").unwrap();
        assert_eq!(generation, 7);
        assert!(reply_value::<u32>(&reply, "missing").is_err());
    }
}
