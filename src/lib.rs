//! polystore: a multi-modal transactional key-value engine.
//!
//! One ordered binary store, three views: raw blobs, documents addressable
//! by nested field paths, and a vertex/edge graph. Callers issue batched,
//! potentially strided requests; results are packed into a caller-owned
//! [`Arena`] and returned as borrowed views.
//!
//! ```
//! use polystore::{Arena, Database, DocFormat, Strided};
//!
//! let db = Database::in_memory();
//! let mut arena = Arena::new();
//! let col = db.collection("").unwrap();
//!
//! let payload = Some(&br#"{"name":"Ann","age":30}"#[..]);
//! db.docs(col)
//!     .write(
//!         None,
//!         Strided::from_slice(&[42]),
//!         None,
//!         DocFormat::Json,
//!         Strided::broadcast(&payload, 1),
//!         Default::default(),
//!         &mut arena,
//!     )
//!     .unwrap();
//!
//! let field = "/age";
//! let ages = db
//!     .docs(col)
//!     .read(
//!         None,
//!         Strided::from_slice(&[42]),
//!         Some(Strided::broadcast(&field, 1)),
//!         DocFormat::Json,
//!         Default::default(),
//!         &mut arena,
//!     )
//!     .unwrap();
//! assert_eq!(ages.get(0), Some(&b"30\0"[..]));
//! ```

#![forbid(unsafe_code)]

pub mod arena;
mod db;
pub mod docs;
pub mod error;
pub mod graph;
mod model;
pub mod strided;
pub mod substrate;

pub use crate::arena::{Arena, TapeView};
pub use crate::db::{Database, ScanView, Txn};
pub use crate::docs::codec::DocFormat;
pub use crate::docs::gather::{bitmap_get, ColumnData, GatherColumn, GatherView, ScalarType};
pub use crate::docs::value::{Doc, FieldPath};
pub use crate::docs::{Docs, PathsView};
pub use crate::error::{Result, StoreError};
pub use crate::graph::{EdgesView, FoundEdges, Graph};
pub use crate::model::{
    ColKey, CollectionId, DropMode, Edge, Key, Options, Role, TxnId, COLLECTION_MAIN,
    DEGREE_MISSING, EDGE_UNSPECIFIED, KEY_UNKNOWN, LEN_MISSING,
};
pub use crate::strided::Strided;
pub use crate::substrate::{Memory, ScanRange, Substrate};
