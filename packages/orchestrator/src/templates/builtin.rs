use super::{EndpointTemplate, ServiceTemplate};
use serde_json::json;

pub(super) fn builtin_templates() -> Vec<ServiceTemplate> {
    vec![figma(), slack(), github(), generic()]
}

fn figma() -> ServiceTemplate {
    ServiceTemplate {
        kind: "figma",
        description: "Figma REST API: current user, files and comments",
        parameters: vec![
            ("file_key", json!("mockfile123")),
            ("file_name", json!("Mock Design File")),
            ("team_id", json!("team-001")),
            ("user_handle", json!("mock.designer")),
            ("user_email", json!("designer@example.com")),
            ("pages", json!(["Page 1"])),
            ("comments", json!([])),
        ],
        endpoints: vec![
            EndpointTemplate::get(
                "/v1/me",
                json!({
                    "id": "user-001",
                    "handle": "{{user_handle}}",
                    "email": "{{user_email}}",
                }),
            ),
            EndpointTemplate::get(
                "/v1/files/{{file_key}}",
                json!({
                    "name": "{{file_name}}",
                    "key": "{{file_key}}",
                    "version": "1",
                    "pages": "{{pages}}",
                }),
            ),
            EndpointTemplate::get(
                "/v1/files/{{file_key}}/comments",
                json!({ "comments": "{{comments}}" }),
            ),
            EndpointTemplate::new(
                "POST",
                "/v1/files/{{file_key}}/comments",
                200,
                json!({ "id": "comment-001", "file_key": "{{file_key}}", "message": "" }),
            ),
            EndpointTemplate::get(
                "/v1/teams/{{team_id}}/projects",
                json!({
                    "name": "Mock Team",
                    "projects": [{ "id": "project-001", "name": "Mock Project" }],
                }),
            ),
        ],
    }
}

fn slack() -> ServiceTemplate {
    ServiceTemplate {
        kind: "slack",
        description: "Slack Web API: auth, conversations, messages and users",
        parameters: vec![
            ("workspace", json!("mock-workspace")),
            ("team_id", json!("T0000MOCK")),
            ("bot_name", json!("mockbot")),
            ("bot_user_id", json!("U0000BOT")),
            ("channels", json!(["general", "random"])),
            ("members", json!([])),
        ],
        endpoints: vec![
            EndpointTemplate::new(
                "POST",
                "/api/auth.test",
                200,
                json!({
                    "ok": true,
                    "url": "https://{{workspace}}.slack.com/",
                    "team": "{{workspace}}",
                    "team_id": "{{team_id}}",
                    "user": "{{bot_name}}",
                    "user_id": "{{bot_user_id}}",
                }),
            ),
            EndpointTemplate::get(
                "/api/conversations.list",
                json!({ "ok": true, "channels": "{{channels}}" }),
            ),
            EndpointTemplate::new(
                "POST",
                "/api/chat.postMessage",
                200,
                json!({ "ok": true, "channel": "C0000MOCK", "ts": "1700000000.000100" }),
            ),
            EndpointTemplate::get(
                "/api/users.list",
                json!({ "ok": true, "members": "{{members}}" }),
            ),
        ],
    }
}

fn github() -> ServiceTemplate {
    ServiceTemplate {
        kind: "github",
        description: "GitHub REST API: user, repository and issues",
        parameters: vec![
            ("owner", json!("mock-org")),
            ("repo", json!("mock-repo")),
            ("default_branch", json!("main")),
            ("login", json!("mock-user")),
            ("issues", json!([])),
        ],
        endpoints: vec![
            EndpointTemplate::get(
                "/user",
                json!({ "login": "{{login}}", "id": 1, "type": "User" }),
            ),
            EndpointTemplate::get(
                "/repos/{{owner}}/{{repo}}",
                json!({
                    "name": "{{repo}}",
                    "full_name": "{{owner}}/{{repo}}",
                    "default_branch": "{{default_branch}}",
                    "private": false,
                }),
            ),
            EndpointTemplate::get("/repos/{{owner}}/{{repo}}/issues", json!("{{issues}}")),
            EndpointTemplate::new(
                "POST",
                "/repos/{{owner}}/{{repo}}/issues",
                201,
                json!({ "number": 1, "state": "open" }),
            ),
        ],
    }
}

fn generic() -> ServiceTemplate {
    ServiceTemplate {
        kind: "generic",
        description: "Generic JSON collection with list, create and status endpoints",
        parameters: vec![
            ("resource", json!("items")),
            (
                "items",
                json!([
                    { "id": 1, "name": "Item 1" },
                    { "id": 2, "name": "Item 2" },
                ]),
            ),
            ("service_name", json!("generic-mock")),
        ],
        endpoints: vec![
            EndpointTemplate::get("/{{resource}}", json!("{{items}}")),
            EndpointTemplate::new("POST", "/{{resource}}", 201, json!({ "created": true })),
            EndpointTemplate::get(
                "/status",
                json!({ "service": "{{service_name}}", "status": "ok" }),
            ),
        ],
    }
}
