//! X/Twitter GraphQL responses.

use serde_json::{json, Map, Value};

use super::{InterceptRule, ProfileRule, RuleAction};
use crate::signals::CaptureSignal;
use crate::store::RecordMap;

pub const GRAPHQL_PREFIX: &str = "https://x.com/i/api/graphql";

pub fn rules() -> Vec<InterceptRule> {
    vec![
        InterceptRule {
            prefix: GRAPHQL_PREFIX,
            operation: "Followers",
            action: RuleAction::Collection {
                name: "followers",
                signal: CaptureSignal::Followers,
                extract: extract_users,
            },
        },
        InterceptRule {
            prefix: GRAPHQL_PREFIX,
            operation: "Following",
            action: RuleAction::Collection {
                name: "following",
                signal: CaptureSignal::Following,
                extract: extract_users,
            },
        },
        InterceptRule {
            prefix: GRAPHQL_PREFIX,
            operation: "UserTweets",
            action: RuleAction::Collection {
                name: "tweets",
                signal: CaptureSignal::Tweets,
                extract: extract_tweets,
            },
        },
        InterceptRule {
            prefix: GRAPHQL_PREFIX,
            operation: "UserByScreenName",
            action: RuleAction::Profile(ProfileRule {
                signal: Some(CaptureSignal::Profile),
                record: |body| Some(body.clone()),
                project: project_profile,
                avatar_file: None,
            }),
        },
    ]
}

/// `TimelineAddEntries` entries of a timeline instruction list.
fn timeline_entries(instructions: &Value) -> impl Iterator<Item = &Value> {
    instructions
        .as_array()
        .into_iter()
        .flatten()
        .filter(|instruction| {
            instruction.get("type").and_then(Value::as_str) == Some("TimelineAddEntries")
        })
        .filter_map(|instruction| instruction.get("entries").and_then(Value::as_array))
        .flatten()
}

fn collect_entries(
    instructions: &Value,
    entry_marker: &str,
    item_pointer: &str,
    key_field: &str,
) -> RecordMap {
    let mut records = Map::new();
    for entry in timeline_entries(instructions) {
        let entry_id = entry.get("entryId").and_then(Value::as_str).unwrap_or_default();
        if !entry_id.contains(entry_marker) {
            continue;
        }
        let Some(item) = entry.pointer(item_pointer) else {
            continue;
        };
        if let Some(key) = item.get(key_field).and_then(Value::as_str) {
            records.insert(key.to_string(), item.clone());
        }
    }
    records
}

/// Followers / Following pages, keyed by `screen_name`.
pub fn extract_users(body: &Value) -> Option<RecordMap> {
    let instructions = body.pointer("/data/user/result/timeline/timeline/instructions")?;
    Some(collect_entries(
        instructions,
        "user",
        "/content/itemContent/user_results/result/legacy",
        "screen_name",
    ))
}

/// Tweets of the profile timeline, keyed by `id_str`.
pub fn extract_tweets(body: &Value) -> Option<RecordMap> {
    let instructions = body
        .pointer("/data/user/result/timeline_v2/timeline/instructions")
        .or_else(|| body.pointer("/data/user/result/timeline/timeline/instructions"))?;
    Some(collect_entries(
        instructions,
        "tweet",
        "/content/itemContent/tweet_results/result/legacy",
        "id_str",
    ))
}

/// Public-safe profile summary sent to the client.
pub fn project_profile(body: &Value) -> Option<Value> {
    let legacy = body.pointer("/data/user/result/legacy")?;
    let field = |name: &str| legacy.get(name).cloned().unwrap_or(Value::Null);
    let image_url = legacy
        .get("profile_image_url_https")
        .and_then(Value::as_str)
        .map(|url| Value::String(url.replace("_normal", "")))
        .unwrap_or(Value::Null);
    Some(json!({
        "name": field("name"),
        "created_at": field("created_at"),
        "description": field("description"),
        "followers_count": field("followers_count"),
        "following_count": field("friends_count"),
        "location": field("location"),
        "image_url": image_url,
    }))
}
