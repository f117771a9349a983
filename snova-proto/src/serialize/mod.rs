//! Defines the [`ByteRead`] and [`ByteWrite`] traits and implements them for the basic types the
//! snova messages are built from.
//!
//! This includes [`bool`], [`u8`], [`u16`], [`u32`], [`u64`], [`str`] (write-only), [`String`]
//! and lists of strings.
//!
//! # Serialization of strings and lists
//! [`String`] and [`str`] are serialized as chunked strings, starting with an [`u16`] indicating
//! the length of the string in bytes, followed by said amount of bytes.
//!
//! Lists of strings start with an [`u16`] element count, followed by each string.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod primitives;
pub mod string;
pub mod u8_repr_enum;

pub use string::*;
pub use u8_repr_enum::*;

/// A value that knows its own wire encoding.
#[allow(async_fn_in_trait)]
pub trait ByteWrite {
    /// Encodes `self` into `writer`. A failed write may have left a partial message behind.
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()>;
}

/// A value that can be decoded from its wire encoding.
#[allow(async_fn_in_trait)]
pub trait ByteRead: Sized {
    /// Decodes one value from `reader`. A failed read may have consumed part of the message.
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self>;
}
