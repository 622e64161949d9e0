use std::{collections::BTreeMap, sync::LazyLock};

use async_trait::async_trait;
use regex::Regex;

use super::{ModerationCategory, ModerationProvider, ModerationScores};

const FLAG_THRESHOLD: f32 = 0.5;

struct Pattern {
    category: ModerationCategory,
    regex: Regex,
    score: f32,
}

static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    use ModerationCategory::*;

    let table: &[(ModerationCategory, &str, f32)] = &[
        (SelfHarm, r"\b(kill|hurt|harm|cut)\s+myself\b", 0.95),
        (SelfHarm, r"\bsuicid(e|al)\b", 0.9),
        (SelfHarm, r"\bend\s+(it\s+all|my\s+life)\b", 0.9),
        (SelfHarm, r"\bself[-\s]?harm\b", 0.8),
        (Hate, r"\bi\s+hate\s+all\s+\w+", 0.7),
        (Hate, r"\bsubhumans?\b", 0.85),
        (Hate, r"\b(exterminate|wipe\s+out)\s+(all\s+)?(the\s+)?\w+", 0.8),
        (
            SexualMinors,
            r"\b(child|children|minor|minors|underage|kid|kids)\b.{0,40}\b(sex|sexual|nude|naked|explicit)\b",
            0.99,
        ),
        (
            SexualMinors,
            r"\b(sex|sexual|nude|naked|explicit)\b.{0,40}\b(child|children|minor|minors|underage)\b",
            0.99,
        ),
        (SexualContent, r"\b(porn|pornographic|xxx)\b", 0.75),
        (SexualContent, r"\b(explicit\s+sex|nude\s+photos?|sexting)\b", 0.7),
        (
            Violence,
            r"\b(kill|shoot|stab|murder)\s+(him|her|them|you|everyone|people|my\s+\w+)\b",
            0.85,
        ),
        (Violence, r"\bhow\s+to\s+(make|build)\s+a\s+(bomb|pipe\s*bomb|weapon)\b", 0.9),
        (Harassment, r"\byou('re|\s+are)\s+(worthless|pathetic|an\s+idiot|stupid|a\s+loser)\b", 0.7),
        (Harassment, r"\bnobody\s+(likes|loves)\s+you\b", 0.65),
        (Malware, r"\b(ransomware|keylogger|botnet|rootkit)\b", 0.8),
        (Malware, r"\breverse\s+shell\b", 0.75),
        (Malware, r"rm\s+-rf\s+/", 0.7),
        (Pii, r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}", 0.6),
        (Pii, r"\b\d{3}-\d{2}-\d{4}\b", 0.85),
        (Pii, r"\b(?:\d[ -]?){13,16}\b", 0.75),
        (
            PromptInjection,
            r"\bignore\s+(all\s+)?(the\s+)?(previous|prior|above)\s+instructions\b",
            0.9,
        ),
        (PromptInjection, r"\b(reveal|print|show)\s+(your|the)\s+system\s+prompt\b", 0.8),
        (PromptInjection, r"\b(jailbreak|dan\s+mode)\b", 0.7),
        (Copyright, r"\b(full|entire|complete)\s+(lyrics|text|book|script)\s+of\b", 0.6),
        (Copyright, r"\b(pirated|torrent\s+link|cracked\s+copy)\b", 0.65),
        (Other, r"\btoken\s+leak\b", 0.55),
    ];

    table
        .iter()
        .map(|(category, pattern, score)| Pattern {
            category: *category,
            regex: Regex::new(&format!("(?i){pattern}")).expect("moderation pattern is valid"),
            score: *score,
        })
        .collect()
});

/// Reference scorer: case-insensitive pattern matching with a fixed score
/// per pattern. A category's score is the best score of its matching
/// patterns; categories at or above the threshold are flagged.
#[derive(Debug, Clone, Default)]
pub struct HeuristicModerationProvider;

impl HeuristicModerationProvider {
    pub fn score_text(&self, content: &str) -> ModerationScores {
        let mut scores = ModerationCategory::ALL
            .into_iter()
            .map(|category| (category, 0.0_f32))
            .collect::<BTreeMap<_, _>>();

        for pattern in PATTERNS.iter() {
            if pattern.regex.is_match(content) {
                let entry = scores.entry(pattern.category).or_insert(0.0);
                if pattern.score > *entry {
                    *entry = pattern.score;
                }
            }
        }

        let flagged = scores
            .iter()
            .filter(|(_, score)| **score >= FLAG_THRESHOLD)
            .map(|(category, _)| *category)
            .collect();

        ModerationScores { scores, flagged }
    }
}

#[async_trait]
impl ModerationProvider for HeuristicModerationProvider {
    async fn score(&self, content: &str) -> anyhow::Result<ModerationScores> {
        Ok(self.score_text(content))
    }
}
