//! mwtrees
//!
//! Adaptive multiwavelet representations of functions on `D`-dimensional boxes, `D` = 1, 2 or 3.
//! A function lives on a [`tree::MwTree`] whose nodes are stored in a per-tree arena, refined
//! where its wavelet coefficients are significant and transformed between the nodal and the
//! compressed representation by the filters of a scaling basis. Trees can be serialised to a flat
//! buffer and moved between processes.
#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

#[macro_use]
extern crate lazy_static;

pub mod arena;
pub mod basis;
pub mod builder;
pub mod constants;
pub mod context;
pub mod filter;
pub mod function;
pub mod hilbert;
pub mod index;
pub mod iterator;
pub mod mra;
pub mod node;
pub mod persistence;
pub mod quadrature;
pub mod transfer;
pub mod transform;
pub mod tree;
pub mod types;
