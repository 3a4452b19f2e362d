use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Database engines a connection can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgresql,
    Mysql,
}

impl DatabaseKind {
    fn scheme(self) -> &'static str {
        match self {
            DatabaseKind::Postgresql => "postgres",
            DatabaseKind::Mysql => "mysql",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::Postgresql => write!(f, "postgresql"),
            DatabaseKind::Mysql => write!(f, "mysql"),
        }
    }
}

/// Everything needed to reach one database on one server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl ConnectionDescriptor {
    /// Identity of the pooled engine serving this descriptor.
    pub fn pool_key(&self) -> String {
        format!("{}_{}", self.name, self.database)
    }

    pub fn connection_url(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}",
            self.kind.scheme(),
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.database),
        )
    }

    /// Same server and credentials, different target database.
    pub fn with_database(&self, database: &str) -> Self {
        Self {
            database: database.trim().to_string(),
            ..self.clone()
        }
    }
}

// Keep passwords out of logs
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Public view of a connection, safe to hand out over the API.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub name: String,
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub database: String,
}

/// Named connections loaded from configuration.
pub struct ConnectionRegistry {
    connections: HashMap<String, ConnectionDescriptor>,
}

impl ConnectionRegistry {
    pub fn new(connections: Vec<ConnectionDescriptor>) -> Self {
        let connections = connections
            .into_iter()
            .map(|conn| (conn.name.clone(), conn))
            .collect();
        Self { connections }
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionDescriptor> {
        self.connections.get(name)
    }

    /// Resolves a connection, optionally retargeted at another database on the same server.
    pub fn resolve(&self, name: &str, database: Option<&str>) -> Option<ConnectionDescriptor> {
        let conn = self.get(name)?;
        match database.map(str::trim) {
            Some(db) if !db.is_empty() => Some(conn.with_database(db)),
            _ => Some(conn.clone()),
        }
    }

    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .connections
            .values()
            .map(|c| ConnectionSummary {
                name: c.name.clone(),
                kind: c.kind,
                host: c.host.clone(),
                port: c.port,
                database: c.database.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
pub(crate) fn test_descriptor(name: &str, database: &str) -> ConnectionDescriptor {
    ConnectionDescriptor {
        name: name.to_string(),
        kind: DatabaseKind::Postgresql,
        host: "localhost".to_string(),
        port: 5432,
        username: "app".to_string(),
        password: "pw".to_string(),
        database: database.to_string(),
    }
}
