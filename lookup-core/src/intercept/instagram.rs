use serde_json::{json, Value};

use super::{InterceptRule, ProfileRule, RuleAction};

pub const GRAPHQL_QUERY: &str = "https://www.instagram.com/graphql/query";
pub const AVATAR_FILE: &str = "profile_image.png";

pub fn rules() -> Vec<InterceptRule> {
    vec![InterceptRule {
        prefix: GRAPHQL_QUERY,
        operation: "",
        action: RuleAction::Profile(ProfileRule {
            signal: Some(crate::signals::CaptureSignal::Profile),
            record: extract_user,
            project: |body| extract_user(body).as_ref().and_then(project_user),
            avatar_file: Some(AVATAR_FILE),
        }),
    }]
}

pub fn extract_user(body: &Value) -> Option<Value> {
    body.pointer("/data/user")
        .filter(|user| user.is_object())
        .cloned()
}

pub fn project_user(user: &Value) -> Option<Value> {
    let field = |name: &str| user.get(name).cloned();
    Some(json!({
        "name": field("full_name")?,
        "description": field("biography").unwrap_or(Value::Null),
        "image_url": field("profile_pic_url").unwrap_or(Value::Null),
        "followers_count": field("follower_count").unwrap_or(Value::Null),
        "following_count": field("following_count").unwrap_or(Value::Null),
        "is_private": field("is_private").unwrap_or(Value::Bool(false)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_graphql_user() {
        let body = json!({"data": {"user": {
            "full_name": "Instagram",
            "biography": "Bringing you closer",
            "profile_pic_url": "https://cdn.example/p.jpg",
            "follower_count": 5,
            "following_count": 1,
            "is_private": false,
            "pk": "25025320"
        }}});
        let user = extract_user(&body).unwrap();
        let projected = project_user(&user).unwrap();
        assert_eq!(projected["description"], "Bringing you closer");
        assert_eq!(projected["followers_count"], 5);
        assert!(projected.get("pk").is_none());
    }

    #[test]
    fn other_queries_do_not_match() {
        assert!(extract_user(&json!({"data": {"xdt_api__v1__feed": {}}})).is_none());
        assert!(extract_user(&json!({"data": {"user": null}})).is_none());
    }
}
