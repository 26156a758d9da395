//! Master election among standalone servers that all claim to be master
//!
//! Every responding server may hold a tie-breaker key naming the master it
//! believes in. The candidate named most often wins; a candidate is matched by
//! exact address first and then ignoring domain suffixes.

use redis_mux_core::types::EndPoint;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// How the winner was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionKind {
    /// There was only one master
    Single,
    /// Every vote named the winner
    Unanimous,
    /// The winner got the most votes
    Plurality,
    /// Several candidates tied on votes; the first seen won
    TieBrokenArbitrarily,
    /// Nobody voted for a known master; the first master won
    Arbitrary,
}

impl fmt::Display for ElectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Single => "single master",
            Self::Unanimous => "unanimous",
            Self::Plurality => "plurality",
            Self::TieBrokenArbitrarily => "tie broken arbitrarily",
            Self::Arbitrary => "arbitrary",
        };
        f.write_str(text)
    }
}

/// Outcome of [`elect_master`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    /// Index of the winner in the candidate list
    pub winner: usize,
    /// Address of the winner
    pub endpoint: EndPoint,
    /// How it was decided
    pub kind: ElectionKind,
}

fn find_candidate(masters: &[EndPoint], vote: &EndPoint) -> Option<usize> {
    masters
        .iter()
        .position(|m| m == vote)
        .or_else(|| masters.iter().position(|m| m.matches_loosely(vote)))
}

/// Pick one master out of `masters`
///
/// `masters` must be in probe completion order, which decides every tie.
/// `votes` are the tie-breaker values read from all responding servers;
/// values that do not parse or name no candidate are ignored.
#[must_use]
pub fn elect_master<'a, I>(masters: &[EndPoint], votes: I, default_port: u16) -> Option<Election>
where
    I: IntoIterator<Item = &'a str>,
{
    let first = masters.first()?;
    if masters.len() == 1 {
        return Some(Election {
            winner: 0,
            endpoint: first.clone(),
            kind: ElectionKind::Single,
        });
    }

    let mut tally: HashMap<usize, usize> = HashMap::new();
    let mut cast = 0usize;
    for vote in votes {
        let vote = vote.trim();
        if vote.is_empty() {
            continue;
        }
        cast += 1;
        match EndPoint::parse_with_default(vote, default_port)
            .ok()
            .and_then(|endpoint| find_candidate(masters, &endpoint))
        {
            Some(index) => *tally.entry(index).or_default() += 1,
            None => debug!("Tie-breaker vote for unknown master {}", vote),
        }
    }

    let Some(&best) = tally.values().max() else {
        warn!(
            "No tie-breaker consensus among {} masters, choosing {}",
            masters.len(),
            first
        );
        return Some(Election {
            winner: 0,
            endpoint: first.clone(),
            kind: ElectionKind::Arbitrary,
        });
    };

    let leaders: Vec<usize> = (0..masters.len())
        .filter(|index| tally.get(index) == Some(&best))
        .collect();
    let winner = leaders[0];
    let kind = if leaders.len() > 1 {
        warn!(
            "Tie-breaker vote is tied between {} masters, choosing {}",
            leaders.len(),
            masters[winner]
        );
        ElectionKind::TieBrokenArbitrarily
    } else if best == cast {
        ElectionKind::Unanimous
    } else {
        ElectionKind::Plurality
    };

    Some(Election {
        winner,
        endpoint: masters[winner].clone(),
        kind,
    })
}
