//! Big-endian field codec.
//!
//! All multi-byte integers on the OTR wire are big-endian. Variable-width
//! fields are length-prefixed: `DATA` is a u32 count of raw bytes, `MPI` is
//! a u32 count of big-endian magnitude bytes with no leading zeros. Ed448
//! points and scalars are fixed 57-byte blocks.

use num_bigint::BigUint;
use num_traits::Zero;

use otr_crypto::dh::mpi_bytes;
use otr_crypto::ed448::{Point, Scalar, POINT_LEN, SCALAR_LEN};

use crate::error::ProtoError;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Raw bytes, no length prefix.
    pub fn write_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// u32-length-prefixed bytes.
    pub fn write_data(&mut self, v: &[u8]) -> &mut Self {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn write_mpi(&mut self, v: &BigUint) -> &mut Self {
        self.write_data(&mpi_bytes(v))
    }

    pub fn write_point(&mut self, p: &Point) -> &mut Self {
        self.write_raw(&p.encode())
    }

    pub fn write_scalar(&mut self, s: &Scalar) -> &mut Self {
        self.write_raw(&s.encode())
    }

    /// Top half of the 16-byte CTR block.
    pub fn write_ctr(&mut self, ctr: u64) -> &mut Self {
        self.write_u64(ctr)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtoError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtoError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtoError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtoError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        self.take(n)
    }

    pub fn read_data(&mut self) -> Result<Vec<u8>, ProtoError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_mpi(&mut self) -> Result<BigUint, ProtoError> {
        let bytes = self.read_data()?;
        if bytes.is_empty() {
            return Ok(BigUint::zero());
        }
        Ok(BigUint::from_bytes_be(&bytes))
    }

    pub fn read_point(&mut self) -> Result<Point, ProtoError> {
        Ok(Point::decode(self.take(POINT_LEN)?)?)
    }

    pub fn read_scalar(&mut self) -> Result<Scalar, ProtoError> {
        Ok(Scalar::decode(self.take(SCALAR_LEN)?)?)
    }

    pub fn read_ctr(&mut self) -> Result<u64, ProtoError> {
        self.read_u64()
    }

    pub fn read_mac20(&mut self) -> Result<[u8; 20], ProtoError> {
        Ok(self.take(20)?.try_into().unwrap())
    }

    pub fn read_auth64(&mut self) -> Result<[u8; 64], ProtoError> {
        Ok(self.take(64)?.try_into().unwrap())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail when a fixed-layout message has bytes left over.
    pub fn expect_end(&self) -> Result<(), ProtoError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(ProtoError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_u8(0x42).write_u16(0xbeef).write_u32(7).write_u64(u64::MAX);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 0x42);
        assert_eq!(dec.read_u16().unwrap(), 0xbeef);
        assert_eq!(dec.read_u32().unwrap(), 7);
        assert_eq!(dec.read_u64().unwrap(), u64::MAX);
        dec.expect_end().unwrap();
    }

    #[test]
    fn data_and_mpi_roundtrip() {
        let n = BigUint::from(0xdead_beefu32);
        let mut enc = Encoder::new();
        enc.write_data(b"payload").write_mpi(&n).write_mpi(&BigUint::zero());
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_data().unwrap(), b"payload");
        assert_eq!(dec.read_mpi().unwrap(), n);
        assert_eq!(dec.read_mpi().unwrap(), BigUint::zero());
    }

    #[test]
    fn truncated_reads_fail() {
        let mut enc = Encoder::new();
        enc.write_u32(100);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        // claims 100 bytes of DATA, provides none
        let mut dec2 = Decoder::new(&bytes);
        assert!(dec2.read_data().is_err());
        assert_eq!(dec.read_u32().unwrap(), 100);
        assert!(dec.read_u8().is_err());
    }

    #[test]
    fn trailing_bytes_detected() {
        let mut enc = Encoder::new();
        enc.write_u16(1).write_u8(9);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        dec.read_u16().unwrap();
        assert!(dec.expect_end().is_err());
    }
}
