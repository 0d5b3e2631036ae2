//! A Rust implementation of semi-honest multi-party computation (MPC) over tensors, based on
//! additive secret sharing with Beaver multiplication triples.
//!
//! This crate lets several parties jointly compute on private tensors without revealing their
//! inputs. Real values are processed as integers in fixed-point encoding, the integers are split
//! into additive shares modulo a field size and every party only ever sees its own shares and
//! masked values.
//!
//! ## Features
//!
//! - Additive sharing between 2 or more parties, with reconstruction as a consuming read
//! - Linear operations without communication, multiplication and matrix multiplication with
//!   Beaver triples from a (semi-)trusted crypto provider
//! - Comparisons, exact division by public integers, `max`/`argmax`, sums and means
//! - 2-D convolution with stride, padding, dilation and groups
//! - Fixed-point tensors whose integers are either plaintext or secret-shared
//!
//! ## Main Components
//!
//! The crate is structured into several modules:
//!
//! * [`party`]: Parties, their object stores and [`party::Pointer`]s to stored objects.
//! * [`provider`]: The [`provider::CryptoProvider`] dealing random masks and triples.
//! * [`shared`]: The [`shared::SharedTensor`] and all protocols on it.
//! * [`fixed`]: The [`fixed::FixedPointTensor`] codec on top of plain or shared integers.
//! * [`ops`]: Operation tags and the name-based [`ops::Dispatch`] façade.
//! * [`session`]: A [`session::Session`] holding the configuration, parties and default provider.
//!
//! ## Example
//!
//! ```
//! use ndarray::arr1;
//! use polytensor::{Config, Error, Session};
//!
//! # fn main() -> Result<(), Error> {
//! let session = Session::new(Config::default())?;
//! let parties = session.parties(&["bob", "alice"]);
//! let james = session.party("james");
//! let provider = session.crypto_provider(&james);
//!
//! let x = session.share_fixed(&arr1(&[1.0, -2.0, 3.0]).into_dyn(), &parties, Some(&provider))?;
//! let y = session.fix_prec(&arr1(&[0.5, 0.5, 0.5]).into_dyn())?;
//! let z = x.mul(&y)?.get()?.decode()?;
//! assert_eq!(z, arr1(&[0.5, -1.0, 1.5]).into_dyn());
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! The protocols are secure against semi-honest adversaries only. The crypto provider learns
//! nothing about the operands, but is trusted to deal correct randomness. Indexing with a
//! secret-shared index reveals the index, see [`shared::IndexDisclosure`].
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod field;
pub mod fixed;
pub(crate) mod kernel;
pub mod ops;
pub mod party;
pub mod provider;
pub mod session;
pub mod shared;

pub use config::Config;
pub use error::{Error, Result};
pub use field::Field;
pub use fixed::{Child, FixedPointTensor};
pub use kernel::Conv2d;
pub use ops::{Dispatch, OpArgs, OpTag, Structural};
pub use party::{ObjectId, Party, PartyId, Pointer};
pub use provider::CryptoProvider;
pub use session::Session;
pub use shared::{IndexDisclosure, Operand, SharedTensor};
