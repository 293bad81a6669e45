use super::handlers::{auth, health};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated document.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` document.
/// Routes added outside (like `OPTIONS /health` or the Swagger UI) are intentionally not documented.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut atesti_tag = Tag::new("atesti");
    atesti_tag.description = Some("Passwordless authentication and session token API".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description =
        Some("One-time codes, passkeys, token grants, and session management".to_string());

    // `routes!` only merges paths/schemas, so tags set here survive unchanged.
    let mut openapi = cargo_openapi();
    openapi.tags = Some(vec![atesti_tag, auth_tag]);

    // `routes!` reads #[utoipa::path] to bind HTTP method + path and add the route to OpenAPI.
    OpenApiRouter::with_openapi(openapi)
        .routes(routes!(health::health))
        .routes(routes!(auth::otp::otp_request))
        .routes(routes!(auth::token::token))
        .routes(routes!(auth::token::logout))
        .routes(routes!(auth::passkey::passkey_register_options))
        .routes(routes!(auth::passkey::passkey_register_verify))
        .routes(routes!(auth::passkey::passkey_authenticate_options))
        .routes(routes!(auth::passkey::passkey_authenticate_verify))
        .routes(routes!(auth::passkey::passkey_list))
        .routes(routes!(auth::passkey::passkey_delete))
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    if let Some(start) = author.find('<') {
        let name = author[..start].trim();
        let email = author[start + 1..].trim_end_matches('>').trim();
        let name = if name.is_empty() { None } else { Some(name) };
        let email = if email.is_empty() { None } else { Some(email) };
        (name, email)
    } else {
        let name = author.trim();
        (if name.is_empty() { None } else { Some(name) }, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let doc = openapi();
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(doc.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(
            doc.info.description.as_deref(),
            Some(env!("CARGO_PKG_DESCRIPTION"))
        );

        let contact = doc.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("Team Atesti"));
            assert_eq!(contact.email.as_deref(), Some("team@atesti.dev"));
        }

        let license = doc.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.name, "BSD-3-Clause");
            assert_eq!(license.identifier.as_deref(), Some("BSD-3-Clause"));
        }
    }

    #[test]
    fn openapi_tags_and_paths() {
        let doc = openapi();
        let tags = doc.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "atesti"));
        assert!(tags.iter().any(|tag| tag.name == "auth"));
        assert!(doc.paths.paths.contains_key("/auth/token"));
        assert!(doc.paths.paths.contains_key("/auth/passkeys/{passkey_id}"));
    }

    #[test]
    fn parse_author_variants() {
        assert_eq!(
            parse_author("Team Atesti <team@atesti.dev>"),
            (Some("Team Atesti"), Some("team@atesti.dev"))
        );
        assert_eq!(parse_author("Team Atesti"), (Some("Team Atesti"), None));
        assert_eq!(parse_author("<team@atesti.dev>"), (None, Some("team@atesti.dev")));
        assert_eq!(parse_author("   "), (None, None));
    }
}
