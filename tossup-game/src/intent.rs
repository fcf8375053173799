use crate::error::{Result, TossError};
use async_trait::async_trait;
use tossup_core::Stake;

/// Stake used when free text names no amount.
pub const DEFAULT_STAKE: Stake = Stake::from_millionths(1_000_000);
/// Hard cap on stakes extracted from free text.
pub const MAX_STAKE: Stake = Stake::from_millionths(10_000_000);

/// What a toss creation request boils down to, however it was phrased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TossIntent {
    pub topic: String,
    pub options: Vec<String>,
    pub stake: Stake,
}

/// Turns free text into a `TossIntent`. The in-repo implementation is a
/// deterministic keyword scanner; an LLM-backed parser slots in behind the
/// same trait.
#[async_trait]
pub trait IntentParser: Send + Sync {
    async fn parse(&self, text: &str) -> Result<TossIntent>;
}

/// Keyword-based intent extraction: first number is the stake (capped),
/// "X or Y" yields the options, the whole text is the topic.
pub struct KeywordIntentParser;

impl KeywordIntentParser {
    fn extract_stake(tokens: &[&str]) -> Stake {
        for token in tokens {
            let token = token.trim_start_matches('$');
            if token.is_empty() || !token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(stake) = token.parse::<Stake>() {
                if !stake.is_zero() {
                    return stake.min(MAX_STAKE);
                }
            }
        }
        DEFAULT_STAKE
    }

    fn extract_options(tokens: &[&str]) -> Vec<String> {
        let strip = |s: &str| {
            s.trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        };

        for (i, token) in tokens.iter().enumerate() {
            if token.eq_ignore_ascii_case("or") && i > 0 && i + 1 < tokens.len() {
                let left = strip(tokens[i - 1]);
                let right = strip(tokens[i + 1]);
                if !left.is_empty() && !right.is_empty() && !left.eq_ignore_ascii_case(&right) {
                    return vec![left, right];
                }
            }
        }
        vec!["yes".to_string(), "no".to_string()]
    }
}

#[async_trait]
impl IntentParser for KeywordIntentParser {
    async fn parse(&self, text: &str) -> Result<TossIntent> {
        let topic = text.trim();
        if topic.is_empty() {
            return Err(TossError::validation(
                "Tell me what the toss is about, e.g. 'Will it rain tomorrow for 2?'",
            ));
        }

        let tokens: Vec<&str> = topic.split_whitespace().collect();
        Ok(TossIntent {
            topic: topic.to_string(),
            options: Self::extract_options(&tokens),
            stake: Self::extract_stake(&tokens),
        })
    }
}
