use serde::{Deserialize, Serialize};

pub type Embedding = Vec<f32>;

/// Length every probe and enrolled embedding must have.
pub const EMBEDDING_DIM: usize = 128;

pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

pub const REASON_INVALID_LENGTH: &str = "invalid embedding length";
pub const REASON_INVALID_VALUES: &str = "invalid embedding values";
pub const REASON_NO_USERS: &str = "no users registered";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledUser {
    pub user_id: String,
    pub embedding: Embedding,
}

impl EnrolledUser {
    pub fn new(user_id: impl Into<String>, embedding: Embedding) -> Self {
        Self { user_id: user_id.into(), embedding }
    }

    /// Records failing this check never enter a matching population.
    pub fn is_valid(&self) -> bool {
        self.invalid_reason().is_none()
    }

    pub fn invalid_reason(&self) -> Option<String> {
        if self.user_id.is_empty() {
            Some("empty user id".into())
        } else if self.embedding.len() != EMBEDDING_DIM {
            Some(format!("embedding has {} values, expected {}", self.embedding.len(), EMBEDDING_DIM))
        } else if !self.embedding.iter().all(|v| v.is_finite()) {
            Some("embedding has non-finite values".into())
        } else {
            None
        }
    }
}

pub fn is_valid_embedding(embedding: &[f32]) -> bool {
    embedding.len() == EMBEDDING_DIM && embedding.iter().all(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub matched_user_id: Option<String>,
    pub distance: Option<f32>,
    pub reason: Option<String>,
}

impl VerificationOutcome {
    pub fn verified(user_id: impl Into<String>, distance: f32) -> Self {
        Self {
            verified: true,
            matched_user_id: Some(user_id.into()),
            distance: Some(distance),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            matched_user_id: None,
            distance: None,
            reason: Some(reason.into()),
        }
    }
}

/// Validated snapshot of enrolled users, in provider order.
#[derive(Debug, Clone, Default)]
pub struct Population {
    users: Vec<EnrolledUser>,
}

impl Population {
    pub fn from_records(records: Vec<EnrolledUser>) -> Self {
        let total = records.len();
        let users: Vec<EnrolledUser> = records
            .into_iter()
            .filter(|user| match user.invalid_reason() {
                Some(reason) => {
                    tracing::warn!("Excluding user {:?} from population: {}", user.user_id, reason);
                    false
                }
                None => true,
            })
            .collect();

        tracing::debug!("Population loaded: {} of {} records usable", users.len(), total);
        Self { users }
    }

    pub fn users(&self) -> &[EnrolledUser] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Nearest-neighbour matcher over an enrolled population.
#[derive(Debug, Clone, Copy)]
pub struct VectorMatcher {
    threshold: f32,
}

impl Default for VectorMatcher {
    fn default() -> Self {
        Self { threshold: DEFAULT_DISTANCE_THRESHOLD }
    }
}

impl VectorMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Pure and deterministic. Ties go to the earliest user in `population`.
    /// Invalid records are skipped, so a population of only invalid records
    /// reports no users.
    pub fn match_probe(&self, probe: &[f32], population: &[EnrolledUser]) -> VerificationOutcome {
        if probe.len() != EMBEDDING_DIM {
            return VerificationOutcome::rejected(REASON_INVALID_LENGTH);
        }
        if !probe.iter().all(|v| v.is_finite()) {
            return VerificationOutcome::rejected(REASON_INVALID_VALUES);
        }
        if population.is_empty() {
            return VerificationOutcome::rejected(REASON_NO_USERS);
        }

        let mut best: Option<(&EnrolledUser, f32)> = None;
        for user in population.iter().filter(|u| u.is_valid()) {
            let distance = euclidean_distance(probe, &user.embedding);
            match best {
                Some((_, min)) if distance >= min => {}
                _ => best = Some((user, distance)),
            }
        }

        match best {
            Some((user, distance)) if distance < self.threshold => {
                VerificationOutcome::verified(user.user_id.clone(), distance)
            }
            Some((user, distance)) => VerificationOutcome::rejected(format!(
                "no match: closest match {} at distance {:.2}",
                user.user_id, distance
            )),
            None => VerificationOutcome::rejected(REASON_NO_USERS),
        }
    }
}

/// `VectorMatcher::match_probe` with the default 0.6 threshold.
pub fn match_embedding(probe: &[f32], population: &[EnrolledUser]) -> VerificationOutcome {
    VectorMatcher::default().match_probe(probe, population)
}
