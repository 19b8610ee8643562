use anyhow::Result;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Color, Table};

use crate::api::models::{Account, Team};
use crate::api::{ApiClient, ApiResultExt};

/// Log in with e-mail and password, prompting for whichever is missing
pub async fn signin(api: &ApiClient, email: Option<String>, password: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => api.prompter().input("E-mail")?,
    };
    let password = match password {
        Some(password) => password,
        None => api.prompter().password("Password")?,
    };

    if let Some(account) = api.account_with(&email, &password).await.recover()? {
        println!("Welcome back to Odevio {}", account.username);
    }
    Ok(())
}

/// Forget the stored token
pub fn signout(api: &ApiClient) -> Result<()> {
    if api.config().clear_token()? {
        println!("You have been disconnected. See you soon...");
    } else {
        println!("You have already been logged out.");
    }
    Ok(())
}

pub async fn profile(api: &ApiClient, highlight_path: bool) -> Result<()> {
    let Some(account) = api.account().await.recover()? else {
        return Ok(());
    };
    let teams = api.teams().await.recover()?.unwrap_or_default();

    let path = api.config().path().display().to_string();
    println!("{}", account_table(&account, &path, highlight_path));
    if !teams.is_empty() {
        println!("Teams to which you have access");
        println!("{}", teams_table(&teams, &account.username));
    }
    Ok(())
}

fn account_table(account: &Account, config_path: &str, highlight_path: bool) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![Cell::new("User").add_attribute(Attribute::Bold), Cell::new("")]);

    table.add_row(vec![Cell::new("Username"), Cell::new(&account.username)]);
    table.add_row(vec![Cell::new("E-mail"), Cell::new(&account.email)]);
    table.add_row(vec![Cell::new("Account type"), Cell::new(&account.account_type)]);

    let mut path_cell = Cell::new(config_path);
    if highlight_path {
        path_cell = path_cell.fg(Color::Magenta).add_attribute(Attribute::Bold);
    }
    table.add_row(vec![Cell::new("Config file"), path_cell]);
    table
}

fn teams_table(teams: &[Team], username: &str) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Name").add_attribute(Attribute::Bold),
            Cell::new("Admin").add_attribute(Attribute::Bold),
        ]);

    for team in teams {
        let admin = format!("{} <{}>", team.manager.username, team.manager.email);
        let mut admin_cell = Cell::new(admin);
        // Teams the user manages
        if team.manager.username == username {
            admin_cell = admin_cell.fg(Color::Green).add_attribute(Attribute::Bold);
        }
        table.add_row(vec![Cell::new(&team.name), admin_cell]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{client, client_with_answers, valid_token};
    use crate::prompt::testing::Answer;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_signin_prompts_and_stores_token() {
        let server = MockServer::start().await;
        let token = valid_token();
        Mock::given(method("POST"))
            .and(path("/api-token-auth/"))
            .and(body_json(json!({"email": "dev@example.com", "password": "hunter2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": token})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/my-account/"))
            .and(header("Authorization", format!("JWT {}", token).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "username": "dev", "email": "dev@example.com", "type": "free"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _dir) = client_with_answers(
            &server.uri(),
            [Answer::Text("hunter2".to_string())],
        );
        signin(&api, Some("dev@example.com".to_string()), None)
            .await
            .unwrap();

        assert_eq!(api.config().token().unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_signin_with_bad_credentials_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api-token-auth/"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "non_field_errors": ["Unable to log in with provided credentials."]
            })))
            .mount(&server)
            .await;

        let (api, _dir) = client(&server.uri());
        signin(&api, Some("dev@example.com".to_string()), Some("wrong".to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signout_twice() {
        let server = MockServer::start().await;
        let (api, _dir) = client(&server.uri());

        signout(&api).unwrap();
        assert_eq!(api.config().token().unwrap(), None);
        signout(&api).unwrap();
    }

    #[test]
    fn test_teams_table_lists_managers() {
        let teams = vec![Team {
            name: "Mobile".to_string(),
            manager: crate::api::models::TeamManager {
                username: "lead".to_string(),
                email: "lead@example.com".to_string(),
            },
        }];
        let rendered = teams_table(&teams, "dev").to_string();
        assert!(rendered.contains("Mobile"));
        assert!(rendered.contains("lead <lead@example.com>"));
    }
}
