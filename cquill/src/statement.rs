//! CQL statements: unprepared query text and prepared-statement handles.

use bytes::Bytes;

use crate::frame::types::Consistency;

/// An unprepared CQL statement.
#[derive(Debug, Clone)]
pub struct Query {
    contents: String,
    consistency: Consistency,
}

impl Query {
    pub fn new(contents: String) -> Self {
        Self {
            contents,
            consistency: Consistency::default(),
        }
    }

    /// Sets the consistency level this statement is executed with.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn get_contents(&self) -> &str {
        &self.contents
    }

    pub fn get_consistency(&self) -> Consistency {
        self.consistency
    }
}

impl From<String> for Query {
    fn from(s: String) -> Query {
        Query::new(s)
    }
}

impl<'a> From<&'a str> for Query {
    fn from(s: &'a str) -> Query {
        Query::new(s.to_owned())
    }
}

/// A statement prepared on the cluster, identified by the server-assigned id.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: Bytes,
    statement: String,
    consistency: Consistency,
}

impl PreparedStatement {
    pub(crate) fn new(id: Bytes, statement: String) -> Self {
        Self {
            id,
            statement,
            consistency: Consistency::default(),
        }
    }

    /// Server-assigned identifier sent back in EXECUTE requests.
    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn get_consistency(&self) -> Consistency {
        self.consistency
    }
}
