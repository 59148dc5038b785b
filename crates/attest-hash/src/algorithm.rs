//! Digest algorithms and the lane abstraction the hashers run them through.
//!
//! A lane is one incremental digest fed with the same byte stream as its
//! siblings. Every lane must be cloneable so that a digest primed with init
//! bytes can be copied once per version; `LaneDigest::clone_boxed` makes that a
//! property of the type rather than something discovered mid-hash.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use crate::error::{HashError, HashResult};

/// Incremental digest state usable as a hashing lane
pub trait LaneDigest: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize_boxed(self: Box<Self>) -> Vec<u8>;
    fn clone_boxed(&self) -> Box<dyn LaneDigest>;
}

/// Adapter for any RustCrypto `Digest`
#[derive(Clone)]
pub struct DigestLane<D>(D);

impl<D> DigestLane<D>
where
    D: digest::Digest + Clone + Send + 'static,
{
    pub fn new() -> Self {
        DigestLane(D::new())
    }
}

impl<D> Default for DigestLane<D>
where
    D: digest::Digest + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> LaneDigest for DigestLane<D>
where
    D: digest::Digest + Clone + Send + 'static,
{
    fn update(&mut self, data: &[u8]) {
        digest::Digest::update(&mut self.0, data);
    }

    fn finalize_boxed(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }

    fn clone_boxed(&self) -> Box<dyn LaneDigest> {
        Box::new(self.clone())
    }
}

/// BLAKE3 through its native incremental API
#[derive(Clone, Default)]
pub struct Blake3Lane(blake3::Hasher);

impl LaneDigest for Blake3Lane {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_boxed(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().as_bytes().to_vec()
    }

    fn clone_boxed(&self) -> Box<dyn LaneDigest> {
        Box::new(self.clone())
    }
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
    Blake3,
}

impl Algorithm {
    /// Canonical name, as recorded alongside stored digests.
    pub const fn name(self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha1 => "SHA-1",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Blake3 => "BLAKE3",
        }
    }

    pub const fn output_len(self) -> usize {
        match self {
            Algorithm::Md5 => 16,
            Algorithm::Sha1 => 20,
            Algorithm::Sha256 | Algorithm::Blake3 => 32,
        }
    }

    /// A fresh digest for this algorithm.
    pub fn lane(self) -> Box<dyn LaneDigest> {
        match self {
            Algorithm::Md5 => Box::new(DigestLane::<md5::Md5>::new()),
            Algorithm::Sha1 => Box::new(DigestLane::<sha1::Sha1>::new()),
            Algorithm::Sha256 => Box::new(DigestLane::<sha2::Sha256>::new()),
            Algorithm::Blake3 => Box::new(Blake3Lane::default()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = HashError;

    /// Case-insensitive; `-` and `_` are ignored ("sha1", "SHA-1", "Sha_1").
    fn from_str(s: &str) -> HashResult<Self> {
        let norm: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match norm.as_str() {
            "MD5" => Ok(Algorithm::Md5),
            "SHA1" | "SHA" => Ok(Algorithm::Sha1),
            "SHA256" => Ok(Algorithm::Sha256),
            "BLAKE3" => Ok(Algorithm::Blake3),
            _ => Err(HashError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Parse a configured algorithm list. At least one lane is required.
pub fn parse_algorithms<S: AsRef<str>>(names: &[S]) -> HashResult<Vec<Algorithm>> {
    if names.is_empty() {
        return Err(HashError::NoLanes);
    }
    names.iter().map(|n| n.as_ref().parse()).collect()
}

/// Hash a byte slice in one shot.
pub fn digest_bytes(algorithm: Algorithm, data: &[u8]) -> Vec<u8> {
    let mut lane = algorithm.lane();
    lane.update(data);
    lane.finalize_boxed()
}

/// Hash everything a reader yields, streaming in 64 KiB blocks.
pub fn digest_reader(algorithm: Algorithm, mut reader: impl Read) -> std::io::Result<(Vec<u8>, u64)> {
    let mut lane = algorithm.lane();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        lane.update(&buf[..n]);
        total += n as u64;
    }
    Ok((lane.finalize_boxed(), total))
}

/// A set of lanes primed with their init bytes.
///
/// `fresh()` hands out clones of the primed state, so the init prefix is
/// digested once no matter how many versions are hashed.
pub struct Lanes {
    algorithms: Vec<Algorithm>,
    primed: Vec<Box<dyn LaneDigest>>,
}

impl Lanes {
    /// Every lane is fed the same `init` prefix.
    pub fn new(algorithms: &[Algorithm], init: &[u8]) -> HashResult<Self> {
        let inits = vec![init.to_vec(); algorithms.len()];
        Self::with_lane_inits(algorithms, &inits)
    }

    /// Each lane gets its own init prefix (e.g. per-participant challenge material).
    pub fn with_lane_inits(algorithms: &[Algorithm], inits: &[Vec<u8>]) -> HashResult<Self> {
        if algorithms.is_empty() {
            return Err(HashError::NoLanes);
        }
        if inits.len() != algorithms.len() {
            return Err(HashError::InitLaneMismatch {
                expected: algorithms.len(),
                given: inits.len(),
            });
        }
        let primed = algorithms
            .iter()
            .zip(inits)
            .map(|(alg, init)| {
                let mut lane = alg.lane();
                lane.update(init);
                lane
            })
            .collect();
        Ok(Lanes {
            algorithms: algorithms.to_vec(),
            primed,
        })
    }

    pub fn len(&self) -> usize {
        self.primed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primed.is_empty()
    }

    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    /// Clones of the primed lanes, ready for a new byte stream.
    pub fn fresh(&self) -> Vec<Box<dyn LaneDigest>> {
        self.primed.iter().map(|l| l.clone_boxed()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests_of_foo() {
        assert_eq!(
            hex::encode(digest_bytes(Algorithm::Sha1, b"foo")),
            "0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33"
        );
        assert_eq!(
            hex::encode(digest_bytes(Algorithm::Md5, b"foo")),
            "acbd18db4cc2f85cedef654fccc4a4d8"
        );
        assert_eq!(
            hex::encode(digest_bytes(Algorithm::Sha256, b"foo")),
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        );
    }

    #[test]
    fn output_lengths_match() {
        for alg in [
            Algorithm::Md5,
            Algorithm::Sha1,
            Algorithm::Sha256,
            Algorithm::Blake3,
        ] {
            assert_eq!(digest_bytes(alg, b"x").len(), alg.output_len(), "{alg}");
        }
    }

    #[test]
    fn parses_common_spellings() {
        assert_eq!("sha1".parse::<Algorithm>().unwrap(), Algorithm::Sha1);
        assert_eq!("SHA-1".parse::<Algorithm>().unwrap(), Algorithm::Sha1);
        assert_eq!("md5".parse::<Algorithm>().unwrap(), Algorithm::Md5);
        assert_eq!("SHA_256".parse::<Algorithm>().unwrap(), Algorithm::Sha256);
        assert_eq!("blake3".parse::<Algorithm>().unwrap(), Algorithm::Blake3);
        assert!(matches!(
            "CRC32".parse::<Algorithm>(),
            Err(HashError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            parse_algorithms::<&str>(&[]),
            Err(HashError::NoLanes)
        ));
    }

    #[test]
    fn primed_clones_share_prefix() {
        let lanes = Lanes::new(&[Algorithm::Sha1, Algorithm::Md5], b"challenge").unwrap();
        let mut fresh = lanes.fresh();
        for lane in fresh.iter_mut() {
            lane.update(b"body");
        }
        let digests: Vec<Vec<u8>> = fresh.into_iter().map(|l| l.finalize_boxed()).collect();
        assert_eq!(digests[0], digest_bytes(Algorithm::Sha1, b"challengebody"));
        assert_eq!(digests[1], digest_bytes(Algorithm::Md5, b"challengebody"));

        // The primed state itself is untouched by use of a clone.
        let again: Vec<Vec<u8>> = lanes.fresh().into_iter().map(|l| l.finalize_boxed()).collect();
        assert_eq!(again[0], digest_bytes(Algorithm::Sha1, b"challenge"));
    }

    #[test]
    fn per_lane_inits_must_match_lane_count() {
        let err = Lanes::with_lane_inits(&[Algorithm::Sha1], &[]).err().unwrap();
        assert!(matches!(
            err,
            HashError::InitLaneMismatch {
                expected: 1,
                given: 0
            }
        ));
    }

    #[test]
    fn digest_reader_streams() {
        let data = vec![0x5au8; 200_000];
        let (d, n) = digest_reader(Algorithm::Blake3, &data[..]).unwrap();
        assert_eq!(n, 200_000);
        assert_eq!(d, digest_bytes(Algorithm::Blake3, &data));
    }
}
