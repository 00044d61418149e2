//! HTML sign-in page shown during the authorization step.

use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};

use crate::oauth::server::ValidatedAuthorization;
use crate::oauth::types::RESPONSE_TYPE_CODE;

const STYLE: &str = r#"
        * { box-sizing: border-box; margin: 0; padding: 0; }
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #f3f4f6; min-height: 100vh; display: flex; align-items: center; justify-content: center; }
        .container { background: white; padding: 32px; border-radius: 12px; box-shadow: 0 4px 6px rgba(0,0,0,0.1); width: 100%; max-width: 400px; }
        h1 { font-size: 24px; margin-bottom: 8px; color: #111827; }
        .subtitle { color: #6b7280; margin-bottom: 24px; }
        .client { font-weight: 600; color: #111827; }
        .error { color: #dc2626; background: #fef2f2; padding: 12px; border-radius: 6px; margin-bottom: 16px; }
        .scope { background: #f3f4f6; padding: 12px; border-radius: 6px; margin-bottom: 16px; font-size: 14px; color: #4b5563; }
        label { display: block; font-size: 14px; font-weight: 500; color: #374151; margin-bottom: 6px; }
        input[type="email"], input[type="password"] { width: 100%; padding: 10px 12px; border: 1px solid #d1d5db; border-radius: 6px; font-size: 16px; margin-bottom: 16px; }
        button { width: 100%; padding: 12px; background: #2563eb; color: white; border: none; border-radius: 6px; font-size: 16px; cursor: pointer; }
"#;

/// Render the sign-in form. Every value that came from the request is
/// escaped; the authorize parameters travel back as hidden fields.
pub fn render_login_page(authorization: &ValidatedAuthorization, error: Option<&str>) -> String {
    let error_html = error
        .map(|msg| format!(r#"<div class="error">{}</div>"#, text(msg)))
        .unwrap_or_default();

    let hidden = [
        ("response_type", RESPONSE_TYPE_CODE),
        ("client_id", authorization.client.client_id.as_str()),
        ("redirect_uri", authorization.redirect_uri.as_str()),
        ("scope", authorization.scope.as_str()),
        ("state", authorization.state.as_deref().unwrap_or("")),
        ("code_challenge", authorization.code_challenge.as_str()),
        (
            "code_challenge_method",
            authorization.code_challenge_method.as_str(),
        ),
    ]
    .iter()
    .map(|(name, value)| {
        format!(
            r#"            <input type="hidden" name="{}" value="{}">"#,
            name,
            attr(value)
        )
    })
    .collect::<Vec<_>>()
    .join("\n");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Sign in</title>
    <style>{style}</style>
</head>
<body>
    <div class="container">
        <h1>Sign in</h1>
        <p class="subtitle"><span class="client">{client}</span> wants to access your account</p>
        {error}
        <div class="scope"><strong>Requested access:</strong> {scope}</div>
        <form method="POST" action="/authorize">
{hidden}
            <label for="email">Email</label>
            <input type="email" id="email" name="email" required autofocus>
            <label for="password">Password</label>
            <input type="password" id="password" name="password" required>
            <button type="submit">Sign in and Authorize</button>
        </form>
    </div>
</body>
</html>"#,
        style = STYLE,
        client = text(&authorization.client.client_name),
        error = error_html,
        scope = text(&authorization.scope),
        hidden = hidden,
    )
}
