use super::{Hash, HashType};
use crypto::digest::Digest;
use crypto::md5::Md5;
use crypto::sha1::Sha1;
use crypto::sha2::{Sha256, Sha512};

/// An in-progress digest. Feed bytes with `input`, then `finish` to obtain
/// the [`Hash`] and the number of bytes consumed.
pub struct Context {
  digest: Digests,
  len: usize,
}

enum Digests {
  Md5(Md5),
  Sha1(Sha1),
  Sha256(Sha256),
  Sha512(Sha512),
}

impl Context {
  pub fn new(ty: HashType) -> Self {
    Self {
      digest: match ty {
        HashType::MD5 => Digests::Md5(Md5::new()),
        HashType::SHA1 => Digests::Sha1(Sha1::new()),
        HashType::SHA256 => Digests::Sha256(Sha256::new()),
        HashType::SHA512 => Digests::Sha512(Sha512::new()),
      },
      len: 0,
    }
  }

  pub fn ty(&self) -> HashType {
    match self.digest {
      Digests::Md5(_) => HashType::MD5,
      Digests::Sha1(_) => HashType::SHA1,
      Digests::Sha256(_) => HashType::SHA256,
      Digests::Sha512(_) => HashType::SHA512,
    }
  }

  pub fn input(&mut self, bytes: &[u8]) {
    self.len += bytes.len();
    match &mut self.digest {
      Digests::Md5(d) => d.input(bytes),
      Digests::Sha1(d) => d.input(bytes),
      Digests::Sha256(d) => d.input(bytes),
      Digests::Sha512(d) => d.input(bytes),
    }
  }

  pub fn finish(mut self) -> (Hash, usize) {
    let ty = self.ty();
    let mut data = [0u8; 64];
    match &mut self.digest {
      Digests::Md5(d) => d.result(&mut data[..16]),
      Digests::Sha1(d) => d.result(&mut data[..20]),
      Digests::Sha256(d) => d.result(&mut data[..32]),
      Digests::Sha512(d) => d.result(&mut data[..64]),
    }
    (
      Hash {
        data,
        len: ty.size(),
        ty,
      },
      self.len,
    )
  }
}
