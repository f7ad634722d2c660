/// Protocol-agnostic command representation

use bytes::Bytes;
use std::fmt;

use crate::protocol::resp::RespValue;

/// Commands that park the connection until data arrives or their own timeout expires
const BLOCKING_COMMANDS: &[&str] = &[
    "BLPOP",
    "BRPOP",
    "BRPOPLPUSH",
    "BLMOVE",
    "BLMPOP",
    "BZPOPMIN",
    "BZPOPMAX",
    "BZMPOP",
];

/// A command name plus its binary-safe arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    /// Create a command; the name is normalized to upper case
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            name: name.as_ref().to_ascii_uppercase(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg<A: AsRef<[u8]>>(mut self, arg: A) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append several arguments
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|a| Bytes::copy_from_slice(a.as_ref())));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Whether the server may hold the reply back for longer than a normal read timeout
    pub fn is_blocking(&self) -> bool {
        BLOCKING_COMMANDS.contains(&self.name.as_str())
    }

    /// Wire representation as a RESP array of bulk strings
    pub fn to_resp(&self) -> RespValue {
        let mut elements = Vec::with_capacity(self.args.len() + 1);
        elements.push(RespValue::bulk(self.name.as_bytes()));
        elements.extend(self.args.iter().map(|a| RespValue::BulkString(Some(a.clone()))));
        RespValue::Array(Some(elements))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let command = Command::new("replicaof").arg("10.0.0.1").arg(6379.to_string());
        assert_eq!(command.name(), "REPLICAOF");
        assert_eq!(command.arguments().len(), 2);
        assert_eq!(command.to_string(), "REPLICAOF 10.0.0.1 6379");
    }

    #[test]
    fn test_blocking_detection() {
        assert!(Command::new("blpop").arg("queue").arg("5").is_blocking());
        assert!(!Command::new("LPOP").arg("queue").is_blocking());
    }

    #[test]
    fn test_to_resp() {
        let command = Command::new("WATCH").args(["a", "b"]);
        match command.to_resp() {
            RespValue::Array(Some(items)) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].as_str(), Some("WATCH"));
                assert_eq!(items[2].as_str(), Some("b"));
            }
            other => panic!("unexpected encoding: {:?}", other),
        }
    }
}
