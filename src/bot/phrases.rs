// src/bot/phrases.rs - Banned phrase matching with split-message fuzzy sessions

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use regex::Regex;
use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

use crate::bot::registry::TimedActionRegistry;
use crate::config::{BannedPhrase, GuildModerationConfig, PhraseMatchMode};
use crate::types::{ChannelId, ChatMessage, EntryKey, GuildId, PunishmentType};

/// A banned phrase found in a message
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseMatch {
    pub phrase_id: String,
    pub punishment: PunishmentType,
    pub delete_message: bool,
    /// Only matched when joined with the user's previous message
    pub split: bool,
}

/// Tail of a user's last message, kept so a fuzzy phrase split across two
/// messages can still be matched
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzySession {
    pub channel_id: ChannelId,
    pub tail: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

enum Matcher {
    Literal(String),
    Regex(Regex),
    Fuzzy { words: Vec<String>, threshold: f32 },
}

struct CompiledPhrase {
    id: String,
    punishment: PunishmentType,
    delete_message: bool,
    matcher: Matcher,
}

struct CompiledPhrases {
    phrases: Vec<CompiledPhrase>,
    max_fuzzy_words: usize,
}

struct CachedGuild {
    source: Arc<GuildModerationConfig>,
    compiled: Arc<CompiledPhrases>,
}

/// Matches messages against each guild's banned phrases.
///
/// Compiled patterns are cached per guild and rebuilt whenever the provider
/// hands out a new configuration.
pub struct PhraseFilter {
    cache: DashMap<GuildId, CachedGuild>,
    sessions: TimedActionRegistry<FuzzySession>,
    session_ttl: Duration,
}

impl PhraseFilter {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            sessions: TimedActionRegistry::new("fuzzy_sessions"),
            session_ttl,
        }
    }

    /// Every banned phrase the message contains
    pub fn check(&self, message: &ChatMessage, config: &Arc<GuildModerationConfig>) -> Vec<PhraseMatch> {
        let compiled = self.compiled_for(message.guild_id, config);
        if compiled.phrases.is_empty() {
            return Vec::new();
        }

        let normalized = normalize(&message.content);
        let words: Vec<String> = normalized.split_whitespace().map(str::to_string).collect();

        let session_key = EntryKey::fuzzy_session(message.guild_id, message.author_id);
        let previous = self.sessions.pop_first(&session_key).filter(|s| {
            s.channel_id == message.channel_id && message.timestamp - s.last_seen <= self.session_ttl
        });

        let mut matches = Vec::new();
        for phrase in &compiled.phrases {
            let (hit, split) = match &phrase.matcher {
                Matcher::Literal(pattern) => (normalized.contains(pattern.as_str()), false),
                Matcher::Regex(regex) => (regex.is_match(&message.content), false),
                Matcher::Fuzzy { words: pattern, threshold } => {
                    if fuzzy_run_matches(&words, pattern, *threshold) {
                        (true, false)
                    } else {
                        let across = previous
                            .as_ref()
                            .is_some_and(|s| split_matches(&s.tail, &words, pattern, *threshold));
                        (across, across)
                    }
                }
            };

            if hit {
                debug!(
                    "Message {} from user {} matched phrase '{}'{}",
                    message.message_id,
                    message.author_id,
                    phrase.id,
                    if split { " across messages" } else { "" }
                );
                matches.push(PhraseMatch {
                    phrase_id: phrase.id.clone(),
                    punishment: phrase.punishment,
                    delete_message: phrase.delete_message,
                    split,
                });
            }
        }

        // A matched message starts over; otherwise remember its tail
        if matches.is_empty() && compiled.max_fuzzy_words > 0 && !words.is_empty() {
            let keep = compiled.max_fuzzy_words.min(words.len());
            let session = FuzzySession {
                channel_id: message.channel_id,
                tail: words[words.len() - keep..].to_vec(),
                last_seen: message.timestamp,
            };
            self.sessions
                .replace(session_key, session, message.timestamp + self.session_ttl);
        }

        matches
    }

    /// Drop sessions that outlived their TTL
    pub fn expire_sessions(&self, now: DateTime<Utc>) -> usize {
        self.sessions.sweep(now).len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn compiled_for(&self, guild_id: GuildId, config: &Arc<GuildModerationConfig>) -> Arc<CompiledPhrases> {
        if let Some(cached) = self.cache.get(&guild_id) {
            if Arc::ptr_eq(&cached.source, config) {
                return Arc::clone(&cached.compiled);
            }
        }

        let compiled = Arc::new(compile(&config.phrases));
        self.cache.insert(
            guild_id,
            CachedGuild {
                source: Arc::clone(config),
                compiled: Arc::clone(&compiled),
            },
        );
        compiled
    }
}

fn compile(phrases: &[BannedPhrase]) -> CompiledPhrases {
    let mut compiled = Vec::with_capacity(phrases.len());
    let mut max_fuzzy_words = 0;

    for phrase in phrases {
        let matcher = match phrase.match_mode {
            PhraseMatchMode::Literal => {
                let pattern = normalize(&phrase.pattern);
                if pattern.trim().is_empty() {
                    warn!("Skipping phrase '{}': pattern is empty after normalization", phrase.id);
                    continue;
                }
                Matcher::Literal(pattern)
            }
            PhraseMatchMode::Regex => match Regex::new(&format!("(?i){}", phrase.pattern)) {
                Ok(regex) => Matcher::Regex(regex),
                Err(e) => {
                    warn!("Skipping phrase '{}': invalid regex: {}", phrase.id, e);
                    continue;
                }
            },
            PhraseMatchMode::Fuzzy { threshold } => {
                let words: Vec<String> = normalize(&phrase.pattern)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                if words.is_empty() {
                    warn!("Skipping phrase '{}': pattern is empty after normalization", phrase.id);
                    continue;
                }
                max_fuzzy_words = max_fuzzy_words.max(words.len());
                Matcher::Fuzzy { words, threshold }
            }
        };
        compiled.push(CompiledPhrase {
            id: phrase.id.clone(),
            punishment: phrase.punishment,
            delete_message: phrase.delete_message,
            matcher,
        });
    }

    CompiledPhrases {
        phrases: compiled,
        max_fuzzy_words,
    }
}

/// Lowercase, strip diacritics and punctuation
pub fn normalize(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c) && !c.is_ascii_punctuation())
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF | 0xFE20..=0xFE2F)
}

/// Does any run of `pattern.len()` words reach the similarity threshold
fn fuzzy_run_matches(words: &[String], pattern: &[String], threshold: f32) -> bool {
    if pattern.is_empty() || words.len() < pattern.len() {
        return false;
    }
    let target = pattern.join(" ");
    words
        .windows(pattern.len())
        .any(|run| similarity(&run.join(" "), &target) >= threshold)
}

/// Match only runs that straddle the boundary between the previous tail and
/// this message, either as separate words or with the boundary words glued
/// together ("bad wo" + "rd").
fn split_matches(tail: &[String], words: &[String], pattern: &[String], threshold: f32) -> bool {
    if tail.is_empty() || words.is_empty() || pattern.is_empty() {
        return false;
    }
    let k = pattern.len();
    let target = pattern.join(" ");
    let straddles = |joined: &[String], boundary: usize, first_after: usize| {
        joined.len() >= k
            && joined
                .windows(k)
                .enumerate()
                .filter(|(start, _)| *start <= boundary && start + k >= first_after)
                .any(|(_, run)| similarity(&run.join(" "), &target) >= threshold)
    };

    let spaced: Vec<String> = tail.iter().chain(words).cloned().collect();
    if straddles(spaced.as_slice(), tail.len() - 1, tail.len() + 1) {
        return true;
    }

    let mut glued: Vec<String> = tail[..tail.len() - 1].to_vec();
    glued.push(format!("{}{}", tail[tail.len() - 1], words[0]));
    glued.extend(words[1..].iter().cloned());
    let glue_at = tail.len() - 1;
    straddles(glued.as_slice(), glue_at, glue_at + 1)
}

/// 1.0 for identical strings, 0.0 for nothing in common
fn similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / longest as f32
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            current[j + 1] = (previous[j + 1] + 1).min(current[j] + 1).min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn phrase(id: &str, pattern: &str, match_mode: PhraseMatchMode) -> BannedPhrase {
        BannedPhrase {
            id: id.to_string(),
            pattern: pattern.to_string(),
            match_mode,
            punishment: PunishmentType::RoleMute,
            delete_message: true,
        }
    }

    fn config(phrases: Vec<BannedPhrase>) -> Arc<GuildModerationConfig> {
        Arc::new(GuildModerationConfig {
            phrases,
            ..Default::default()
        })
    }

    fn message(seconds: i64, channel_id: u64, content: &str) -> ChatMessage {
        ChatMessage {
            guild_id: 1,
            channel_id,
            message_id: seconds as u64,
            author_id: 5,
            content: content.to_string(),
            mention_count: 0,
            attachments: Vec::new(),
            timestamp: at(seconds),
        }
    }

    fn ids(matches: &[PhraseMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.phrase_id.as_str()).collect()
    }

    #[test]
    fn test_literal_ignores_case_and_accents() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![phrase("crypto", "free crypto", PhraseMatchMode::Literal)]);

        let matches = filter.check(&message(0, 10, "Get FRÉE Crypto now!"), &config);
        assert_eq!(ids(&matches), vec!["crypto"]);
        assert!(filter.check(&message(1, 10, "crypto is free"), &config).is_empty());
    }

    #[test]
    fn test_punctuation_only_literal_matches_nothing() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![
            phrase("marks", "???", PhraseMatchMode::Literal),
            phrase("dots", "...", PhraseMatchMode::Fuzzy { threshold: 0.8 }),
        ]);

        assert!(filter.check(&message(0, 10, "hello friends"), &config).is_empty());
        assert!(filter.check(&message(1, 10, "what???"), &config).is_empty());
    }

    #[test]
    fn test_regex_phrase() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![phrase("invite", r"discord\.gg/\w+", PhraseMatchMode::Regex)]);

        assert_eq!(filter.check(&message(0, 10, "join DISCORD.GG/abc"), &config).len(), 1);
        assert!(filter.check(&message(1, 10, "discord is nice"), &config).is_empty());
    }

    #[test]
    fn test_fuzzy_matches_typos() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![phrase(
            "slur",
            "badword",
            PhraseMatchMode::Fuzzy { threshold: 0.8 },
        )]);

        assert_eq!(filter.check(&message(0, 10, "you are a b4dword"), &config).len(), 1);
        assert!(filter.check(&message(1, 10, "you are a bird"), &config).is_empty());
    }

    #[test]
    fn test_fuzzy_phrase_split_across_messages() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![phrase(
            "scam",
            "send me nitro",
            PhraseMatchMode::Fuzzy { threshold: 0.9 },
        )]);

        assert!(filter.check(&message(0, 10, "hey, send me"), &config).is_empty());
        assert_eq!(filter.active_sessions(), 1);

        let matches = filter.check(&message(3, 10, "nitro please"), &config);
        assert_eq!(ids(&matches), vec!["scam"]);
        assert!(matches[0].split);
        assert_eq!(filter.active_sessions(), 0);
    }

    #[test]
    fn test_fuzzy_word_glued_across_messages() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![phrase(
            "slur",
            "badword",
            PhraseMatchMode::Fuzzy { threshold: 1.0 },
        )]);

        assert!(filter.check(&message(0, 10, "bad"), &config).is_empty());
        assert_eq!(filter.check(&message(1, 10, "word"), &config).len(), 1);
    }

    #[test]
    fn test_split_requires_same_channel_and_fresh_session() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![phrase(
            "scam",
            "send me nitro",
            PhraseMatchMode::Fuzzy { threshold: 0.9 },
        )]);

        filter.check(&message(0, 10, "send me"), &config);
        assert!(filter.check(&message(1, 11, "nitro"), &config).is_empty());

        filter.check(&message(2, 10, "send me"), &config);
        assert!(filter.check(&message(60, 10, "nitro"), &config).is_empty());
    }

    #[test]
    fn test_sessions_expire() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let config = config(vec![phrase("x", "alpha beta", PhraseMatchMode::Fuzzy { threshold: 0.9 })]);

        filter.check(&message(0, 10, "hello"), &config);
        assert_eq!(filter.expire_sessions(at(10)), 0);
        assert_eq!(filter.expire_sessions(at(31)), 1);
        assert_eq!(filter.active_sessions(), 0);
    }

    #[test]
    fn test_cache_follows_config_changes() {
        let filter = PhraseFilter::new(Duration::seconds(30));
        let first = config(vec![phrase("a", "apple", PhraseMatchMode::Literal)]);
        let second = config(vec![phrase("b", "banana", PhraseMatchMode::Literal)]);

        assert_eq!(filter.check(&message(0, 10, "apple banana"), &first).len(), 1);
        assert_eq!(ids(&filter.check(&message(1, 10, "apple banana"), &second)), vec!["b"]);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert!((similarity("abcd", "abcx") - 0.75).abs() < f32::EPSILON);
    }
}
