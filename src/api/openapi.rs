use super::handlers::{admin, health, host, keybase, portal, proxy, users};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both
/// served and included in the generated spec.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads #[utoipa::path] to bind HTTP method + path.
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(admin::auth_state_get))
        .routes(routes!(admin::session_post))
        .routes(routes!(admin::secondary_post))
        .routes(routes!(admin::request_get))
        .routes(routes!(admin::callback_get))
        .routes(routes!(admin::logout_get))
        .routes(routes!(users::users_get, users::users_delete))
        .routes(routes!(portal::auth_state_get))
        .routes(routes!(portal::session_post))
        .routes(routes!(portal::secondary_post))
        .routes(routes!(portal::request_get))
        .routes(routes!(portal::callback_get))
        .routes(routes!(portal::logout_get))
        .routes(routes!(keybase::challenge_post, keybase::challenge_put))
        .routes(routes!(keybase::secondary_put))
        .routes(routes!(keybase::associate_post))
        .routes(routes!(keybase::associate_get))
        .routes(routes!(keybase::info_get))
        .routes(routes!(keybase::check_put))
        .routes(routes!(keybase::validate_put, keybase::validate_delete))
        .routes(routes!(proxy::session_post))
        .routes(routes!(proxy::secondary_post))
        .routes(routes!(proxy::request_get))
        .routes(routes!(proxy::callback_get))
        .routes(routes!(proxy::logout_get))
        .routes(routes!(host::host_post));

    let mut admin_tag = Tag::new("admin");
    admin_tag.description = Some("Management console authentication".to_string());

    let mut portal_tag = Tag::new("portal");
    portal_tag.description = Some("User portal authentication".to_string());

    let mut proxy_tag = Tag::new("proxy");
    proxy_tag.description = Some("Proxy surface authentication".to_string());

    let mut keybase_tag = Tag::new("keybase");
    keybase_tag.description =
        Some("Keybase challenge login and device association".to_string());

    let mut ssh_tag = Tag::new("ssh");
    ssh_tag.description = Some("SSH certificate issuance".to_string());

    router.get_openapi_mut().tags = Some(vec![
        admin_tag,
        portal_tag,
        proxy_tag,
        keybase_tag,
        ssh_tag,
    ]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    OpenApiBuilder::new().info(info).build()
}

#[cfg(test)]
mod tests {
    use super::openapi;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn openapi_covers_the_three_surfaces() {
        let spec = openapi();
        let paths = &spec.paths.paths;
        assert!(paths.contains_key("/admin/auth/session"));
        assert!(paths.contains_key("/user/auth/session"));
        assert!(paths.contains_key("/proxy/{service_id}/auth/session"));
        assert!(paths.contains_key("/user/keybase/associate/{token}"));
        assert!(paths.contains_key("/ssh/host"));
    }
}
