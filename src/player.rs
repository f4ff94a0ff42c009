//! Players, their scores, and point-in-time snapshots of the score table.

use std::{collections::HashSet, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Numeric type used to represent a player's accumulated score.
pub type Score = u64;

/// Length in bytes of an [Address].
pub const ADDRESS_LEN: usize = 20;

/// A ledger account identifier. Parsed from 40 hex digits with an optional
/// `0x` prefix, case-insensitive, and always displayed as lowercase `0x…`.
///
/// Ordering is bytewise, which matches lexicographic ordering of the
/// lowercase hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl From<[u8; ADDRESS_LEN]> for Address {
    fn from(value: [u8; ADDRESS_LEN]) -> Self {
        Address(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        if digits.len() != ADDRESS_LEN * 2 {
            return Err(InputError::InvalidAddress(s.to_owned()));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| InputError::InvalidAddress(s.to_owned()))?;

        Ok(Address(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A player's accumulated score as held by the score store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerScore {
    pub address: Address,
    pub score: Score,
}

impl PlayerScore {
    pub fn new(address: Address, score: Score) -> Self {
        PlayerScore { address, score }
    }
}

/// An unvalidated score record, as it arrives from an untyped boundary such
/// as a JSON request body or a document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPlayerScore {
    pub address: String,
    pub score: i64,
}

impl TryFrom<RawPlayerScore> for PlayerScore {
    type Error = InputError;

    fn try_from(raw: RawPlayerScore) -> Result<Self, Self::Error> {
        let address = raw.address.parse()?;
        let score = Score::try_from(raw.score)
            .map_err(|_| InputError::NegativeScore(address, raw.score))?;

        Ok(PlayerScore { address, score })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("player {0} has negative score {1}")]
    NegativeScore(Address, i64),
    #[error("player {0} appears more than once in the snapshot")]
    DuplicateAddress(Address),
}

/// An immutable, point-in-time view of every player's score. This is the
/// sole input to one reward cycle; later changes to the score store are
/// never reflected in an existing snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    players: Vec<PlayerScore>,
}

impl Snapshot {
    /// Creates a snapshot, rejecting any address that appears twice.
    pub fn new(players: Vec<PlayerScore>) -> Result<Self, InputError> {
        let mut seen = HashSet::with_capacity(players.len());
        if let Some(dup) = players.iter().find(|p| !seen.insert(p.address)) {
            return Err(InputError::DuplicateAddress(dup.address));
        }

        Ok(Snapshot { players })
    }

    /// Validates a set of raw records and builds a snapshot from them.
    pub fn from_raw<I>(records: I) -> Result<Self, InputError>
    where
        I: IntoIterator<Item = RawPlayerScore>,
    {
        let players = records
            .into_iter()
            .map(PlayerScore::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(players)
    }

    #[inline]
    pub fn players(&self) -> &[PlayerScore] {
        &self.players
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.players.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Returns the snapshotted score of `address`, if present.
    pub fn score_of(&self, address: &Address) -> Option<Score> {
        self.players
            .iter()
            .find(|p| &p.address == address)
            .map(|p| p.score)
    }

    /// Sum of all scores in the snapshot.
    pub fn total_score(&self) -> u128 {
        self.players.iter().map(|p| p.score as u128).sum()
    }

    /// Drops every player in `excluded` from the snapshot.
    pub fn excluding(mut self, excluded: &HashSet<Address>) -> Self {
        self.players.retain(|p| !excluded.contains(&p.address));

        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Address whose bytes are all `n`, for compact test fixtures.
    pub(crate) fn addr(n: u8) -> Address {
        Address::from_bytes([n; ADDRESS_LEN])
    }

    #[test]
    fn address_parse_and_display() {
        let a: Address =
            "0xAbCdEf0123456789abcdef0123456789ABCDEF01".parse().unwrap();
        assert_eq!(
            a.to_string(),
            "0xabcdef0123456789abcdef0123456789abcdef01"
        );

        let unprefixed: Address =
            "abcdef0123456789abcdef0123456789abcdef01".parse().unwrap();
        assert_eq!(a, unprefixed);
    }

    #[test]
    fn address_rejects_garbage() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0xzz cdef0123456789abcdef0123456789abcdef01"
            .parse::<Address>()
            .is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn address_order_matches_hex_order() {
        let mut addrs = [addr(0xb0), addr(0x0a), addr(0x1f)];
        addrs.sort();

        let hex: Vec<_> = addrs.iter().map(|a| a.to_string()).collect();
        let mut sorted = hex.clone();
        sorted.sort();
        assert_eq!(hex, sorted);
    }

    #[test]
    fn address_serde_as_string() {
        let json = serde_json::to_string(&addr(0x11)).unwrap();
        assert_eq!(json, format!("\"{}\"", addr(0x11)));

        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr(0x11));
    }

    #[test]
    fn snapshot_rejects_duplicates() {
        let err = Snapshot::new(vec![
            PlayerScore::new(addr(1), 5),
            PlayerScore::new(addr(2), 5),
            PlayerScore::new(addr(1), 7),
        ])
        .unwrap_err();

        assert_eq!(err, InputError::DuplicateAddress(addr(1)));
    }

    #[test]
    fn snapshot_from_raw_validates() {
        let good = RawPlayerScore {
            address: addr(3).to_string(),
            score: 12,
        };
        let snapshot = Snapshot::from_raw([good.clone()]).unwrap();
        assert_eq!(snapshot.score_of(&addr(3)), Some(12));
        assert_eq!(snapshot.total_score(), 12);

        let negative = RawPlayerScore { score: -1, ..good };
        assert_eq!(
            Snapshot::from_raw([negative]).unwrap_err(),
            InputError::NegativeScore(addr(3), -1)
        );

        let bad_addr = RawPlayerScore {
            address: "player-one".into(),
            score: 1,
        };
        assert!(matches!(
            Snapshot::from_raw([bad_addr]),
            Err(InputError::InvalidAddress(_))
        ));
    }

    #[test]
    fn excluded_players_leave_snapshot() {
        let snapshot = Snapshot::new(
            (1..=3).map(|n| PlayerScore::new(addr(n), n as u64)).collect(),
        )
        .unwrap();

        let rest = snapshot.excluding(&HashSet::from([addr(2), addr(9)]));

        assert_eq!(rest.len(), 2);
        assert_eq!(rest.score_of(&addr(2)), None);
        assert_eq!(rest.total_score(), 4);
    }
}
