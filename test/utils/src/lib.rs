use serde_json::json;
use serde_json::Value;

/// `GET /ai/sessions` body with one read and one unread session.
pub fn remote_sessions_fixture() -> Value {
    return json!({
        "data": [
            {
                "chatId": "chat-1",
                "title": "Rust release notes",
                "createdAt": "2024-03-01T10:00:00Z",
                "updatedAt": "2024-03-02T08:30:00Z",
                "lastSeenAt": "2024-03-02T08:30:00Z"
            },
            {
                "chatId": "chat-2",
                "createdAt": "2024-03-03T09:00:00Z",
                "updatedAt": "2024-03-03T09:15:00Z"
            }
        ]
    });
}

/// First page of `GET /ai/sessions/chat-1/messages`, pointing at an older page.
pub fn messages_page_fixture() -> Value {
    return json!({
        "data": {
            "messages": [
                {
                    "id": "msg-2",
                    "role": "assistant",
                    "content": [{ "type": "text", "text": "It stabilizes async closures." }],
                    "metadata": { "model": "llama2" },
                    "createdAt": "2024-03-02T08:30:00Z"
                },
                {
                    "id": "msg-1",
                    "role": "user",
                    "content": [{ "type": "text", "text": "What changed in the last release?" }],
                    "createdAt": "2024-03-02T08:29:00Z"
                }
            ],
            "nextBefore": "2024-03-02T08:29:00Z"
        }
    });
}
