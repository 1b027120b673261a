// Copyright 2025 Graphmem (https://github.com/graphmem)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Store adapters for Graphmem: object store (S3-compatible), graph store
//! (Neo4j HTTP Cypher API) and vector store (Qdrant REST API).

pub mod graph;
pub mod object;
pub mod text;
pub mod vector;

pub use graph::{GraphExport, GraphStore};
pub use object::{ObjectEntry, ObjectStore, BACKUP_PREFIX};
pub use vector::{l2_normalize, payload_to_chunk, VectorPoint, VectorStore};
