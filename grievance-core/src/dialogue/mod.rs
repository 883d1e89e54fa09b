//! `DialogueEngine`: turn-by-turn state machine for the intake call.
//!
//! ```text
//!            refusal                         strong phrase | farewell | gratitude
//! Greeting ───────────► Closing ◄────────────────────────────── Listening
//!     │                                                              ▲
//!     └───── salutation / anything else ────────────────────────────┘
//! ```
//!
//! Rule precedence for one utterance:
//! 1. `Closing` is terminal: no mutation, no action.
//! 2. Empty text is ignored.
//! 3. Questions suppress exit detection (text still recorded in Listening).
//! 4. Greeting: refusal ends the call, a salutation just opens it, anything
//!    else becomes the first grievance text (probe if already substantial).
//! 5. Listening: exit phrases close; short fragments are silent; the probe is
//!    played once; afterwards long utterances may get a backchannel.
//!
//! The engine does no I/O. Thresholds come from `DialogueConfig`, wording
//! from a `PhraseTable`, randomness from an injected `Rng`.

pub mod phrases;

pub use phrases::{normalize_tokens, PhraseTable};

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use phrases::CompiledPhrases;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Greeting,
    Listening,
    /// Terminal.
    Closing,
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConversationState::Greeting => "greeting",
            ConversationState::Listening => "listening",
            ConversationState::Closing => "closing",
        })
    }
}

/// What the bot should say in response to an utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "cue")]
pub enum Action {
    EarlyExit,
    Probe,
    Closing,
    /// Acknowledgment cue chosen from `DialogueConfig::backchannel_cues`.
    Backchannel(String),
}

impl Action {
    /// Cue id the playback scheduler plays for this action.
    pub fn cue_id(&self) -> &str {
        match self {
            Action::EarlyExit => "early_exit",
            Action::Probe => "probe_details",
            Action::Closing => "closing",
            Action::Backchannel(cue) => cue,
        }
    }

    /// Actions that end the call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::EarlyExit | Action::Closing)
    }
}

/// Result of processing one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub state: ConversationState,
    pub action: Option<Action>,
}

/// The caller's statement as accumulated so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrievanceRecord {
    /// Utterances joined by single spaces. Append-only until closing.
    pub text: String,
    pub first_utterance_at: Option<DateTime<Utc>>,
    pub word_count: usize,
    pub probe_played: bool,
    pub should_disconnect: bool,
}

impl GrievanceRecord {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn append(&mut self, utterance: &str, words: usize, at: DateTime<Utc>) {
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(utterance);
        self.word_count += words;
        self.first_utterance_at.get_or_insert(at);
    }
}

/// Word-count thresholds and backchannel tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DialogueConfig {
    /// Greeting refusals must be shorter than this. Default: 4.
    pub refusal_max_words: usize,
    /// Opening statements longer than this get the probe. Default: 7.
    pub substantial_words: usize,
    /// Listening utterances shorter than this are fragments. Default: 2.
    pub noise_min_words: usize,
    /// Listening utterances longer than this trigger the one-time probe. Default: 5.
    pub probe_words: usize,
    /// After the probe, utterances longer than this may get a backchannel. Default: 7.
    pub backchannel_words: usize,
    /// Chance of a backchannel on an eligible utterance. Default: 0.7.
    pub backchannel_probability: f64,
    /// Words allowed after a strong exit phrase. Default: 2.
    pub max_trailing_words: usize,
    /// Acknowledgment cue ids, drawn uniformly.
    pub backchannel_cues: Vec<String>,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            refusal_max_words: 4,
            substantial_words: 7,
            noise_min_words: 2,
            probe_words: 5,
            backchannel_words: 7,
            backchannel_probability: 0.7,
            max_trailing_words: 2,
            backchannel_cues: vec!["ack_1".into(), "ack_2".into(), "ack_3".into()],
        }
    }
}

impl DialogueConfig {
    /// Clamp the probability into `[0, 1]`; non-finite values disable
    /// backchannels.
    pub fn normalize(&mut self) {
        self.backchannel_probability = if self.backchannel_probability.is_finite() {
            self.backchannel_probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.backchannel_cues.retain(|c| !c.trim().is_empty());
    }
}

/// The dialogue state machine for one call.
pub struct DialogueEngine<R = StdRng> {
    config: DialogueConfig,
    phrases: CompiledPhrases,
    rng: R,
    state: ConversationState,
    record: GrievanceRecord,
}

impl DialogueEngine<StdRng> {
    /// Engine with an OS-seeded generator.
    pub fn with_entropy(config: DialogueConfig, phrases: &PhraseTable) -> Self {
        Self::new(config, phrases, StdRng::from_entropy())
    }

    /// Engine whose backchannel choices are reproducible.
    pub fn seeded(config: DialogueConfig, phrases: &PhraseTable, seed: u64) -> Self {
        Self::new(config, phrases, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> DialogueEngine<R> {
    pub fn new(mut config: DialogueConfig, phrases: &PhraseTable, rng: R) -> Self {
        config.normalize();
        Self {
            config,
            phrases: CompiledPhrases::compile(phrases),
            rng,
            state: ConversationState::Greeting,
            record: GrievanceRecord::default(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn record(&self) -> &GrievanceRecord {
        &self.record
    }

    pub fn config(&self) -> &DialogueConfig {
        &self.config
    }

    /// Process one final utterance received now.
    pub fn process(&mut self, text: &str) -> Turn {
        self.process_at(text, Utc::now())
    }

    /// Process one final utterance received at `at`.
    pub fn process_at(&mut self, text: &str, at: DateTime<Utc>) -> Turn {
        let action = self.step(text, at);
        Turn {
            state: self.state,
            action,
        }
    }

    fn step(&mut self, text: &str, at: DateTime<Utc>) -> Option<Action> {
        if self.state == ConversationState::Closing {
            return None;
        }
        let utterance = text.trim();
        let tokens = normalize_tokens(utterance);
        if tokens.is_empty() {
            return None;
        }
        let words = tokens.len();

        if self.phrases.is_question(utterance, &tokens) {
            debug!(state = %self.state, "question detected, exit triggers suppressed");
            if self.state == ConversationState::Listening {
                self.record.append(utterance, words, at);
            }
            return None;
        }

        match self.state {
            ConversationState::Greeting => self.greeting(utterance, &tokens, at),
            ConversationState::Listening => self.listening(utterance, &tokens, at),
            ConversationState::Closing => None,
        }
    }

    fn greeting(&mut self, utterance: &str, tokens: &[String], at: DateTime<Utc>) -> Option<Action> {
        if self
            .phrases
            .is_refusal(tokens, self.config.refusal_max_words)
        {
            info!(utterance, "refusal in greeting, ending call");
            self.close();
            return Some(Action::EarlyExit);
        }

        self.state = ConversationState::Listening;
        if self.phrases.is_salutation(tokens) {
            debug!(utterance, "salutation, now listening");
            return None;
        }

        self.record.append(utterance, tokens.len(), at);
        if tokens.len() > self.config.substantial_words {
            self.record.probe_played = true;
            debug!(words = tokens.len(), "substantial opening, probing");
            return Some(Action::Probe);
        }
        None
    }

    fn listening(&mut self, utterance: &str, tokens: &[String], at: DateTime<Utc>) -> Option<Action> {
        let words = tokens.len();
        self.record.append(utterance, words, at);

        if let Some(reason) = self.exit_reason(tokens) {
            info!(
                reason = reason.as_str(),
                words = self.record.word_count,
                "closing phrase detected"
            );
            self.close();
            return Some(Action::Closing);
        }

        if words < self.config.noise_min_words {
            return None;
        }

        if !self.record.probe_played {
            if words > self.config.probe_words {
                self.record.probe_played = true;
                return Some(Action::Probe);
            }
            return None;
        }

        if words > self.config.backchannel_words
            && !self.config.backchannel_cues.is_empty()
            && self.rng.gen_bool(self.config.backchannel_probability)
        {
            return self
                .config
                .backchannel_cues
                .choose(&mut self.rng)
                .cloned()
                .map(Action::Backchannel);
        }
        None
    }

    fn exit_reason(&self, tokens: &[String]) -> Option<String> {
        if let Some(phrase) = self
            .phrases
            .strong_exit(tokens, self.config.max_trailing_words)
        {
            return Some(format!("strong phrase '{phrase}'"));
        }
        if self.phrases.ends_with_farewell(tokens) {
            return Some("farewell".into());
        }
        if self.phrases.is_solo_gratitude(tokens) {
            return Some("gratitude".into());
        }
        None
    }

    fn close(&mut self) {
        self.state = ConversationState::Closing;
        self.record.should_disconnect = true;
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;

    use super::*;

    fn engine() -> DialogueEngine {
        DialogueEngine::seeded(DialogueConfig::default(), &PhraseTable::english(), 7)
    }

    /// Engine already past the greeting with the probe spent.
    fn probed<R: Rng>(rng: R) -> DialogueEngine<R> {
        let mut e = DialogueEngine::new(DialogueConfig::default(), &PhraseTable::english(), rng);
        let t = e.process("my supervisor keeps changing my shifts without telling me");
        assert_eq!(t.action, Some(Action::Probe));
        e
    }

    #[test]
    fn short_refusal_in_greeting_exits_early() {
        let mut e = engine();
        let turn = e.process("no");
        assert_eq!(turn.state, ConversationState::Closing);
        assert_eq!(turn.action, Some(Action::EarlyExit));
        assert!(e.record().should_disconnect);
        assert!(e.record().is_empty());
    }

    #[test]
    fn short_statement_with_refusal_word_is_kept() {
        let mut e = engine();
        let turn = e.process("nothing works here");
        assert_eq!(turn.state, ConversationState::Listening);
        assert_ne!(turn.action, Some(Action::EarlyExit));
        assert!(!e.record().should_disconnect);
        assert_eq!(e.record().text, "nothing works here");
    }

    #[test]
    fn long_refusal_opens_listening() {
        let mut e = engine();
        let turn = e.process("no I actually have a big problem");
        assert_eq!(turn.state, ConversationState::Listening);
        assert_eq!(turn.action, None);
        assert_eq!(e.record().text, "no I actually have a big problem");
    }

    #[test]
    fn substantial_opening_plays_probe() {
        let mut e = engine();
        let turn =
            e.process("my pay was cut without notice and nobody explained why to me at all");
        assert_eq!(turn.state, ConversationState::Listening);
        assert_eq!(turn.action, Some(Action::Probe));
        assert!(e.record().probe_played);
        assert!(e.record().first_utterance_at.is_some());
    }

    #[test]
    fn salutation_opens_without_recording() {
        let mut e = engine();
        let turn = e.process("Hello!");
        assert_eq!(turn, Turn { state: ConversationState::Listening, action: None });
        assert!(e.record().is_empty());
        assert!(e.record().first_utterance_at.is_none());
    }

    #[test]
    fn strong_phrase_closes_and_freezes_record() {
        let mut e = engine();
        e.process("hello");
        e.process("the canteen food made me sick twice");
        let turn = e.process("that's all");
        assert_eq!(turn.state, ConversationState::Closing);
        assert_eq!(turn.action, Some(Action::Closing));

        let frozen = e.record().clone();
        assert!(frozen.should_disconnect);
        assert!(frozen.text.ends_with("that's all"));

        for later in ["one more thing actually", "no", "bye", ""] {
            let t = e.process(later);
            assert_eq!(t, Turn { state: ConversationState::Closing, action: None });
        }
        assert_eq!(e.record(), &frozen);
    }

    #[test]
    fn question_suppresses_exit_but_is_recorded() {
        let mut e = engine();
        e.process("hello");
        let turn = e.process("is that all you need?");
        assert_eq!(turn, Turn { state: ConversationState::Listening, action: None });
        assert_eq!(e.record().text, "is that all you need?");
        assert!(!e.record().should_disconnect);
    }

    #[test]
    fn question_in_greeting_changes_nothing() {
        let mut e = engine();
        let turn = e.process("who is this?");
        assert_eq!(turn, Turn { state: ConversationState::Greeting, action: None });
        assert!(e.record().is_empty());
    }

    #[test]
    fn exit_phrase_with_long_tail_does_not_close() {
        let mut e = engine();
        e.process("hello");
        let turn = e.process("that's all the money I had saved for rent");
        assert_eq!(turn.state, ConversationState::Listening);
        assert_ne!(turn.action, Some(Action::Closing));
    }

    #[test]
    fn farewell_suffix_and_solo_gratitude_close() {
        let mut e = engine();
        e.process("hello");
        assert_eq!(e.process("okay bye").action, Some(Action::Closing));

        let mut e = engine();
        e.process("hello");
        assert_eq!(e.process("Thank you.").action, Some(Action::Closing));

        let mut e = engine();
        e.process("hello");
        let t = e.process("thank you for listening to all of this");
        assert_eq!(t.state, ConversationState::Listening);
    }

    #[test]
    fn fragments_are_recorded_silently() {
        let mut e = engine();
        e.process("hello");
        let turn = e.process("um");
        assert_eq!(turn.action, None);
        assert_eq!(e.record().text, "um");
    }

    #[test]
    fn probe_plays_once() {
        let mut e = engine();
        e.process("hello");
        assert_eq!(e.process("short one here").action, None);
        assert_eq!(
            e.process("they locked the break room for a week").action,
            Some(Action::Probe)
        );
        assert!(e.record().probe_played);
        // A second long utterance never probes again.
        let again = e.process("and the heating has been broken all winter long too");
        assert_ne!(again.action, Some(Action::Probe));
    }

    #[test]
    fn backchannel_uses_injected_rng() {
        let mut always = probed(StepRng::new(0, 0));
        let turn = always.process("the manager shouts at the junior staff every single morning");
        assert_eq!(turn.action, Some(Action::Backchannel("ack_1".into())));

        let mut never = probed(StepRng::new(u64::MAX, 0));
        let turn = never.process("the manager shouts at the junior staff every single morning");
        assert_eq!(turn.action, None);
    }

    #[test]
    fn backchannel_skips_short_utterances() {
        let mut e = probed(StepRng::new(0, 0));
        assert_eq!(e.process("it happens a lot").action, None);
    }

    #[test]
    fn seeded_engines_agree() {
        let script = [
            "hello",
            "my contract was never renewed and nobody told me why at all",
            "the new manager ignores every email I send him about my hours",
            "we also lost our overtime pay when the new system came in",
            "and the safety gear in the warehouse is years out of date",
        ];
        let run = |seed| {
            let mut e = DialogueEngine::seeded(DialogueConfig::default(), &PhraseTable::english(), seed);
            script.iter().map(|u| e.process(u).action).collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        for action in run(42).into_iter().flatten().skip(1) {
            assert!(matches!(action, Action::Backchannel(ref c) if c.starts_with("ack_")));
        }
    }

    #[test]
    fn config_normalize_clamps_probability() {
        let mut c = DialogueConfig {
            backchannel_probability: 3.0,
            backchannel_cues: vec!["ack_1".into(), " ".into()],
            ..Default::default()
        };
        c.normalize();
        assert_eq!(c.backchannel_probability, 1.0);
        assert_eq!(c.backchannel_cues, vec!["ack_1".to_string()]);

        c.backchannel_probability = f64::NAN;
        c.normalize();
        assert_eq!(c.backchannel_probability, 0.0);
    }

    #[test]
    fn action_cue_ids() {
        assert_eq!(Action::EarlyExit.cue_id(), "early_exit");
        assert_eq!(Action::Probe.cue_id(), "probe_details");
        assert_eq!(Action::Closing.cue_id(), "closing");
        assert_eq!(Action::Backchannel("ack_2".into()).cue_id(), "ack_2");
        assert!(Action::Closing.is_terminal() && !Action::Probe.is_terminal());
    }
}
