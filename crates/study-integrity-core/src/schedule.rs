use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::normalize::EXCLUDED_SESSION;
use crate::IntegrityError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum StudyVariant {
    #[serde(rename = "TET")]
    Tet,
    #[serde(rename = "GIDI")]
    Gidi,
    #[serde(rename = "KAISER")]
    Kaiser,
    #[serde(rename = "SPANISH")]
    Spanish,
}

impl StudyVariant {
    pub const ALL: [Self; 4] = [Self::Tet, Self::Gidi, Self::Kaiser, Self::Spanish];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tet => "TET",
            Self::Gidi => "GIDI",
            Self::Kaiser => "KAISER",
            Self::Spanish => "SPANISH",
        }
    }

    /// Keys are matched case-sensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TET" => Some(Self::Tet),
            "GIDI" => Some(Self::Gidi),
            "KAISER" => Some(Self::Kaiser),
            "SPANISH" => Some(Self::Spanish),
            _ => None,
        }
    }
}

impl Display for StudyVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionSchedule {
    pub name: String,
    pub tasks: Vec<String>,
}

impl SessionSchedule {
    fn from_static(name: &str, tasks: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tasks: tasks.iter().map(|task| (*task).to_string()).collect(),
        }
    }
}

/// Expected session order for one study variant, each session carrying its
/// expected task order. Position is significant at both levels.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StudySchedule {
    pub variant: StudyVariant,
    pub sessions: Vec<SessionSchedule>,
}

impl StudySchedule {
    #[must_use]
    pub fn session_names(&self) -> Vec<&str> {
        self.sessions.iter().map(|session| session.name.as_str()).collect()
    }

    /// Session order used for the session-level check. Sessions whose events
    /// never survive normalization are left out, otherwise every participant
    /// would mismatch at that position.
    #[must_use]
    pub fn checked_session_names(&self) -> Vec<&str> {
        self.sessions
            .iter()
            .map(|session| session.name.as_str())
            .filter(|name| *name != EXCLUDED_SESSION)
            .collect()
    }

    #[must_use]
    pub fn tasks_for(&self, session_name: &str) -> Option<&[String]> {
        self.sessions
            .iter()
            .find(|session| session.name == session_name)
            .map(|session| session.tasks.as_slice())
    }

    /// # Errors
    /// Returns [`IntegrityError::Validation`] when a session or task name is
    /// blank, or a session name appears twice.
    pub fn validate(&self) -> Result<(), IntegrityError> {
        if self.sessions.is_empty() {
            return Err(IntegrityError::Validation(format!(
                "schedule for {} MUST define at least one session",
                self.variant
            )));
        }

        let mut seen = BTreeSet::new();
        for session in &self.sessions {
            if session.name.trim().is_empty() {
                return Err(IntegrityError::Validation(format!(
                    "schedule for {} contains a blank session name",
                    self.variant
                )));
            }
            if !seen.insert(session.name.as_str()) {
                return Err(IntegrityError::Validation(format!(
                    "schedule for {} lists session `{}` more than once",
                    self.variant, session.name
                )));
            }
            if session.tasks.iter().any(|task| task.trim().is_empty()) {
                return Err(IntegrityError::Validation(format!(
                    "schedule for {} session `{}` contains a blank task id",
                    self.variant, session.name
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScheduleRegistry {
    schedules: BTreeMap<StudyVariant, StudySchedule>,
}

impl ScheduleRegistry {
    #[must_use]
    pub fn builtin() -> Self {
        let schedules = [tet_schedule(), gidi_schedule(), kaiser_schedule(), spanish_schedule()]
            .into_iter()
            .map(|schedule| (schedule.variant, schedule))
            .collect();
        Self { schedules }
    }

    /// # Errors
    /// Returns [`IntegrityError::UnknownStudyVariant`] when the key is not one
    /// of the registered variants.
    pub fn get_schedule(&self, key: &str) -> Result<&StudySchedule, IntegrityError> {
        StudyVariant::parse(key)
            .and_then(|variant| self.get(variant))
            .ok_or_else(|| IntegrityError::UnknownStudyVariant(key.to_string()))
    }

    #[must_use]
    pub fn get(&self, variant: StudyVariant) -> Option<&StudySchedule> {
        self.schedules.get(&variant)
    }

    /// Replace the schedule registered for `schedule.variant`.
    ///
    /// # Errors
    /// Returns [`IntegrityError::Validation`] when the replacement is invalid.
    pub fn with_override(mut self, schedule: StudySchedule) -> Result<Self, IntegrityError> {
        schedule.validate()?;
        self.schedules.insert(schedule.variant, schedule);
        Ok(self)
    }

    pub fn schedules(&self) -> impl Iterator<Item = &StudySchedule> {
        self.schedules.values()
    }
}

impl Default for ScheduleRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn calm_pretest() -> SessionSchedule {
    SessionSchedule::from_static(
        "preTest",
        &[
            "Credibility",
            "Demographics",
            "MentalHealthHistory",
            "AnxietyIdentity",
            "AnxietyTriggers",
            "recognitionRatings",
            "RR",
            "BBSIQ",
            "Comorbid",
            "Wellness",
            "Mechanisms",
            "Covid19",
            "TechnologyUse",
        ],
    )
}

fn calm_third_session() -> SessionSchedule {
    SessionSchedule::from_static(
        "thirdSession",
        &[
            "preAffect",
            "3",
            "postAffect",
            "CC",
            "SessionReview",
            "AnxietyIdentity",
            "OA",
            "DASS21_AS",
            "recognitionRatings",
            "RR",
            "BBSIQ",
            "Comorbid",
            "Wellness",
            "Mechanisms",
            "Covid19",
            "ReturnIntention",
        ],
    )
}

fn calm_fifth_session() -> SessionSchedule {
    SessionSchedule::from_static(
        "fifthSession",
        &[
            "preAffect",
            "5",
            "postAffect",
            "CC",
            "SessionReview",
            "AnxietyIdentity",
            "OA",
            "DASS21_AS",
            "recognitionRatings",
            "RR",
            "BBSIQ",
            "Comorbid",
            "Wellness",
            "Mechanisms",
            "Covid19",
            "HelpSeeking",
            "Evaluation",
            "AssessingProgram",
        ],
    )
}

fn calm_follow_up(name: &str) -> SessionSchedule {
    SessionSchedule::from_static(
        name,
        &[
            "AnxietyIdentity",
            "OA",
            "DASS21_AS",
            "recognitionRatings",
            "RR",
            "BBSIQ",
            "Comorbid",
            "Wellness",
            "Mechanisms",
            "Covid19",
            "HelpSeeking",
        ],
    )
}

// TET and GIDI share the CALM program structure; GIDI adds a second follow-up.
fn calm_sessions() -> Vec<SessionSchedule> {
    vec![
        calm_pretest(),
        SessionSchedule::from_static(
            "firstSession",
            &[
                "preAffect",
                "1",
                "postAffect",
                "CC",
                "SessionReview",
                "OA",
                "CoachPrompt",
                "Gidi",
                "ReturnIntention",
            ],
        ),
        SessionSchedule::from_static(
            "secondSession",
            &["2", "SessionReview", "OA", "ReturnIntention"],
        ),
        calm_third_session(),
        SessionSchedule::from_static(
            "fourthSession",
            &["4", "SessionReview", "OA", "ReturnIntention"],
        ),
        calm_fifth_session(),
        calm_follow_up("PostFollowUp"),
    ]
}

fn tet_schedule() -> StudySchedule {
    StudySchedule { variant: StudyVariant::Tet, sessions: calm_sessions() }
}

fn gidi_schedule() -> StudySchedule {
    let mut sessions = calm_sessions();
    sessions.push(calm_follow_up("PostFollowUp2"));
    StudySchedule { variant: StudyVariant::Gidi, sessions }
}

fn kaiser_schedule() -> StudySchedule {
    StudySchedule {
        variant: StudyVariant::Kaiser,
        sessions: vec![
            SessionSchedule::from_static(
                "preTest",
                &[
                    "Identity",
                    "Credibility",
                    "Demographics",
                    "MentalHealthHistory",
                    "OA",
                    "DASS21_AS",
                    "AnxietyTriggers",
                    "recognitionRatings",
                    "RR",
                    "Comorbid",
                    "Wellness",
                    "Mechanisms",
                    "Covid19",
                    "TechnologyUse",
                ],
            ),
            SessionSchedule::from_static(
                "firstSession",
                &[
                    "preAffect",
                    "1",
                    "postAffect",
                    "CC",
                    "SessionReview",
                    "OA",
                    "CoachPrompt",
                    "ReturnIntention",
                ],
            ),
            SessionSchedule::from_static(
                "secondSession",
                &["2", "SessionReview", "OA", "ReturnIntention"],
            ),
            SessionSchedule::from_static(
                "thirdSession",
                &[
                    "preAffect",
                    "3",
                    "postAffect",
                    "CC",
                    "SessionReview",
                    "OA",
                    "DASS21_AS",
                    "recognitionRatings",
                    "RR",
                    "Comorbid",
                    "Wellness",
                    "Mechanisms",
                    "Covid19",
                    "ReturnIntention",
                ],
            ),
            SessionSchedule::from_static(
                "fourthSession",
                &["4", "SessionReview", "OA", "ReturnIntention"],
            ),
            SessionSchedule::from_static(
                "fifthSession",
                &[
                    "preAffect",
                    "5",
                    "postAffect",
                    "CC",
                    "SessionReview",
                    "OA",
                    "DASS21_AS",
                    "recognitionRatings",
                    "RR",
                    "Comorbid",
                    "Wellness",
                    "Mechanisms",
                    "Covid19",
                    "HelpSeeking",
                    "Evaluation",
                    "AssessingProgram",
                ],
            ),
            SessionSchedule::from_static(
                "PostFollowUp",
                &[
                    "OA",
                    "DASS21_AS",
                    "recognitionRatings",
                    "RR",
                    "Comorbid",
                    "Wellness",
                    "Mechanisms",
                    "Covid19",
                    "HelpSeeking",
                ],
            ),
        ],
    }
}

fn spanish_schedule() -> StudySchedule {
    StudySchedule {
        variant: StudyVariant::Spanish,
        sessions: vec![
            SessionSchedule::from_static(EXCLUDED_SESSION, &["OA", "DASS21_AS"]),
            SessionSchedule::from_static(
                "preTest",
                &[
                    "Demographics",
                    "MentalHealthHistory",
                    "Acculturation",
                    "Ethnicity",
                    "Comorbid",
                    "recognitionRatings",
                    "RR",
                    "Covid19",
                    "preAffect",
                    "1",
                    "postAffect",
                    "CC",
                ],
            ),
            SessionSchedule::from_static(
                "secondSession",
                &[
                    "preAffect",
                    "2",
                    "postAffect",
                    "OA",
                    "Comorbid",
                    "DASS21_AS",
                    "recognitionRatings",
                    "RR",
                    "Evaluation",
                ],
            ),
        ],
    }
}
