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

//! Core domain types, configuration, ontologies and chunking for Graphmem.

pub mod chunker;
pub mod config;
pub mod error;
pub mod ontology;
pub mod types;

pub use chunker::SemanticChunker;
pub use config::ServerConfig;
pub use error::{MemoryError, Result};
pub use ontology::{Ontology, OntologyRegistry};
