//! Wire messages for hash-diff reconciliation.
//!
//! All payloads are serde types; the transport decides the actual encoding.
//! The protocol is a four-level descent over the stamp tree: root content
//! hashes, table hashes, row hashes, then full cell stamps, with keyed
//! values reconciled in a single level.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::mergeable::{
    CellHashes, Hash, MergeableContent, RowHashes, TablesStamp, ValuesStamp,
};
use crate::store::Id;

/// An addressed message between replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending replica.
    pub from: Id,
    /// Addressee; `None` broadcasts to every other connected replica.
    pub to: Option<Id>,
    /// Correlation id linking a [`Message::Response`] back to its request.
    pub request_id: Option<String>,
    /// The payload.
    pub message: Message,
}

/// Protocol messages.
///
/// `Get*` variants are requests answered with a correlated
/// [`Message::Response`]; the rest are unsolicited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Reply to an earlier request, correlated by the envelope's request id.
    Response(Response),
    /// Ask a peer for its root content hashes.
    GetContentHashes,
    /// Unsolicited announcement of root hashes; received by a peer with
    /// auto-pull enabled it triggers a pull cycle.
    ContentHashes {
        /// Root hash of the tabular half.
        tables: Hash,
        /// Root hash of the keyed-value half.
        values: Hash,
    },
    /// Unsolicited stamped delta, applied directly with last-writer-wins.
    ContentDiff(MergeableContent),
    /// The requester's table and value hashes; answered with
    /// [`Response::TableDiff`] and [`Response::ValueDiff`] material.
    GetTableDiff {
        /// Requester's hash per table.
        table_hashes: IndexMap<Id, Hash>,
    },
    /// The requester's row hashes for tables known to differ.
    GetRowDiff {
        /// Requester's row hashes, scoped to differing tables.
        row_hashes: RowHashes,
    },
    /// The requester's cell hashes for rows known to differ.
    GetCellDiff {
        /// Requester's cell hashes, scoped to differing rows.
        cell_hashes: CellHashes,
    },
    /// The requester's hash per keyed value.
    GetValueDiff {
        /// Requester's hash per keyed value.
        value_hashes: IndexMap<Id, Hash>,
    },
}

/// Replies to the `Get*` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// The responder's root hashes.
    ContentHashes {
        /// Root hash of the tabular half.
        tables: Hash,
        /// Root hash of the keyed-value half.
        values: Hash,
    },
    /// Tables the requester lacks, plus ids and hashes of tables present on
    /// both sides that differ and need a finer descent.
    TableDiff {
        /// Full payload for tables absent on the requester.
        tables: TablesStamp,
        /// Responder hashes for tables that exist on both sides but differ.
        differing_table_hashes: IndexMap<Id, Hash>,
    },
    /// Rows the requester lacks, plus differing row ids and hashes.
    RowDiff {
        /// Full payload for rows absent on the requester.
        tables: TablesStamp,
        /// Responder hashes for rows that exist on both sides but differ.
        differing_row_hashes: RowHashes,
    },
    /// Full stamps for the cells that are absent or differ.
    CellDiff {
        /// Cell-level payload.
        tables: TablesStamp,
    },
    /// Full stamps for the keyed values that are absent or differ.
    ValueDiff {
        /// Value-level payload.
        values: ValuesStamp,
    },
}

impl Envelope {
    /// Build a request envelope with a fresh correlation id.
    pub fn request(from: &str, to: &str, request_id: String, message: Message) -> Self {
        Self {
            from: from.to_string(),
            to: Some(to.to_string()),
            request_id: Some(request_id),
            message,
        }
    }

    /// Build a response envelope echoing the request's correlation id.
    pub fn response(from: &str, to: &str, request_id: String, response: Response) -> Self {
        Self {
            from: from.to_string(),
            to: Some(to.to_string()),
            request_id: Some(request_id),
            message: Message::Response(response),
        }
    }

    /// Build an unsolicited broadcast envelope.
    pub fn broadcast(from: &str, message: Message) -> Self {
        Self {
            from: from.to_string(),
            to: None,
            request_id: None,
            message,
        }
    }
}
