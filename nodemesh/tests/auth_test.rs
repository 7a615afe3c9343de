//! Credential lifecycle: registration, token refresh, revocation on retirement.

mod common;

use common::{descriptor, mesh_with, test_config, MockTransport};
use nodemesh::auth::AuthMethod;
use nodemesh::Error;

#[tokio::test]
async fn test_registration_issues_working_credentials() {
    let mesh = mesh_with(test_config(), MockTransport::new());
    let reg = mesh.register_node(descriptor("alpha"), false).await.unwrap();

    assert_eq!(reg.token_type, "Bearer");
    assert!(reg.access_expires_at < reg.refresh_expires_at);
    assert!(reg.api_key.starts_with("nmk_"));

    let principal = mesh
        .auth()
        .authenticate(&reg.access_token, mesh.registry())
        .unwrap();
    assert_eq!(principal.id, reg.node.id);
    assert_eq!(principal.method, AuthMethod::AccessToken);

    let principal = mesh
        .auth()
        .authenticate(&reg.api_key, mesh.registry())
        .unwrap();
    assert_eq!(principal.id, reg.node.id);
    assert_eq!(principal.method, AuthMethod::ApiKey);
}

#[tokio::test]
async fn test_refresh_invalidates_previous_refresh_token() {
    let mesh = mesh_with(test_config(), MockTransport::new());
    let reg = mesh.register_node(descriptor("alpha"), false).await.unwrap();

    let pair = mesh.auth().refresh(&reg.refresh_token).unwrap();
    assert_ne!(pair.refresh_token, reg.refresh_token);
    assert_eq!(
        mesh.auth().validate_access_token(&pair.access_token).unwrap(),
        reg.node.id
    );

    let err = mesh.auth().refresh(&reg.refresh_token).unwrap_err();
    assert!(matches!(err, Error::InvalidRefreshToken));
    assert!(mesh.auth().refresh(&pair.refresh_token).is_ok());
}

#[tokio::test]
async fn test_deactivation_revokes_every_credential() {
    let mesh = mesh_with(test_config(), MockTransport::new());
    let reg = mesh.register_node(descriptor("alpha"), false).await.unwrap();
    mesh.deactivate_node(&reg.node.id).unwrap();

    assert!(mesh
        .auth()
        .authenticate(&reg.access_token, mesh.registry())
        .is_err());
    assert!(mesh
        .auth()
        .authenticate(&reg.api_key, mesh.registry())
        .is_err());
    assert!(matches!(
        mesh.auth().refresh(&reg.refresh_token),
        Err(Error::InvalidRefreshToken)
    ));
}

#[tokio::test]
async fn test_re_registration_rotates_credentials() {
    let mesh = mesh_with(test_config(), MockTransport::new());
    let first = mesh.register_node(descriptor("alpha"), false).await.unwrap();

    let mut again = descriptor("alpha");
    again.id = Some(first.node.id.clone());
    let second = mesh.register_node(again, false).await.unwrap();

    assert_eq!(second.node.id, first.node.id);
    assert_ne!(second.api_key, first.api_key);
    assert!(mesh.registry().verify_api_key(&first.api_key).is_none());
    assert!(mesh.auth().refresh(&first.refresh_token).is_err());
    assert!(mesh
        .auth()
        .validate_access_token(&second.access_token)
        .is_ok());
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let mesh = mesh_with(test_config(), MockTransport::new());
    mesh.register_node(descriptor("alpha"), false).await.unwrap();
    let err = mesh
        .register_node(descriptor("Alpha"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateNode(_)));
}

#[tokio::test]
async fn test_verified_registration_requires_ping() {
    let transport = MockTransport::new();
    let mesh = mesh_with(test_config(), transport.clone());
    transport.set_ping("alpha", false);

    let err = mesh
        .register_node(descriptor("alpha"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NodeUnavailable(_)));
    assert!(mesh.registry().list(true).is_empty());

    transport.set_ping("alpha", true);
    assert!(mesh.register_node(descriptor("alpha"), true).await.is_ok());
}
