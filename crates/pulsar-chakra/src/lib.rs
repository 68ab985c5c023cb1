// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pulsar Project Developers

//! # pulsar-chakra
//!
//! The bytecode compilation back end of the Pulsar JavaScript engine,
//! inspired by the code generators of Microsoft's Chakra lineage.
//!
//! ## Overview
//!
//! This crate turns a parsed ECMAScript 3 syntax tree into an executable
//! routine for a stack-oriented managed runtime:
//! - A byte-level instruction emitter with evaluation-stack bookkeeping
//! - Label management with forward/backward branch fix-ups
//! - Local and argument slot allocation with compact encodings
//! - Nested exception-handling regions and table serialization
//! - A lexical scope-chain compiler covering declarative, `with`-style
//!   object, and global scopes
//!
//! The source-text lexer/parser, the full runtime value domain, and the
//! standard library are external collaborators; this crate defines the AST
//! node types, the runtime-loader handle model, and a minimal runtime scope
//! surface as its interfaces to them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pulsar_chakra::{ast, compile_program, loader::Module, OptimizationInfo};
//!
//! let module = Module::new();
//! let program = ast::Program::new(vec![/* statements from the parser */]);
//! let routine = compile_program(&module, &program, OptimizationInfo::default())?;
//! println!("{}", routine); // disassembly listing
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod compiler;
pub mod loader;
pub mod runtime;

// Re-exports for convenience
pub use compiler::codegen::{compile_program, OptimizationInfo};
pub use compiler::emitter::EmitError;
pub use compiler::{KindSet, ValueKind};
pub use loader::{Module, Routine, Token};

use thiserror::Error as ThisError;

/// Errors that can occur while compiling a program.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Syntax error propagated unchanged from the parser.
    #[error("SyntaxError: {0}")]
    SyntaxError(String),

    /// A malformed emission sequence. These indicate a code-generator bug,
    /// never a user error, and abort the compilation with no artifact.
    #[error("invalid emission: {0}")]
    InvalidEmission(#[from] EmitError),

    /// Reference error surfaced by the runtime scope helpers.
    #[error("ReferenceError: {0} is not defined")]
    ReferenceError(String),
}

/// Result type for compilation operations.
pub type Result<T> = std::result::Result<T, Error>;
