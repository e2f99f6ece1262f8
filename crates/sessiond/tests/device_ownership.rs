//! End-to-end device ownership and policy scenarios.

mod common;

use common::{fixture, PolicyBlob};
use sessiond::supervisor::ChildEvent;
use sessiond_core::crypto::{generate_signing_key, public_key_blob};
use sessiond_core::error::SessionError;
use sessiond_core::events::Signal;
use sessiond_core::policy::{DeviceSettings, PolicyEnvelope};

#[tokio::test]
async fn first_owner_flow_takes_ownership() {
    let mut fx = fixture();
    assert!(!fx.paths.owner_key.exists());

    // First real sign-in on an unmanaged device triggers key
    // generation.
    fx.manager.start_session("a@b").unwrap();
    let status = match fx.child_events.recv().await.unwrap() {
        ChildEvent::GeneratorExited { username, status } => {
            assert_eq!(username, "a@b");
            status
        }
        other => panic!("unexpected event: {other:?}"),
    };

    // Stand in for the worker: generate the pair into the user's
    // keystore and leave the public half at the pickup path.
    let owner_pair = generate_signing_key();
    fx.keystore.insert_key("a@b", owner_pair.clone());
    std::fs::create_dir_all(fx.paths.generated_key_file.parent().unwrap()).unwrap();
    std::fs::write(&fx.paths.generated_key_file, public_key_blob(&owner_pair)).unwrap();

    fx.manager.handle_generator_exit("a@b", &status);
    fx.manager.flush_persistence().await;

    // The pickup file is consumed, the key is persisted, and the
    // policy records the owner.
    assert!(!fx.paths.generated_key_file.exists());
    assert_eq!(
        std::fs::read(&fx.paths.owner_key).unwrap(),
        public_key_blob(&owner_pair)
    );
    assert!(fx.emitter.saw(&Signal::OwnerKeySet(true)));

    let envelope = PolicyEnvelope::parse(&fx.manager.retrieve_policy()).unwrap();
    let data = envelope.decode_data().unwrap();
    assert_eq!(data.username.as_deref(), Some("a@b"));
    let settings = data.decode_settings().unwrap();
    assert!(settings.user_whitelist.iter().any(|u| u == "a@b"));
    assert_eq!(settings.allow_new_users, Some(true));
}

#[tokio::test]
async fn store_with_rotation_replaces_the_owner_key() {
    let mut fx = fixture();
    let first = generate_signing_key();
    let second = generate_signing_key();

    // Before any session, install is allowed.
    let install = PolicyBlob::device().username("a@b").sign_install(&first);
    fx.manager
        .store_policy(&install)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        std::fs::read(&fx.paths.owner_key).unwrap(),
        public_key_blob(&first)
    );

    // A rotation carries the new key plus a proof under the old one.
    let rotate = PolicyBlob::device()
        .username("a@b")
        .sign_rotate(&second, &first);
    fx.manager
        .store_policy(&rotate)
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(fx.manager.retrieve_policy(), rotate);
    assert_eq!(
        std::fs::read(&fx.paths.owner_key).unwrap(),
        public_key_blob(&second)
    );
}

#[tokio::test]
async fn tampered_store_is_rejected_without_side_effects() {
    let mut fx = fixture();
    let first = generate_signing_key();
    let stranger = generate_signing_key();

    let install = PolicyBlob::device().username("a@b").sign_install(&first);
    fx.manager
        .store_policy(&install)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    fx.emitter.clear();

    // Signed by the wrong key: terminal rejection for this request.
    let tampered = PolicyBlob::device().username("evil@b").sign_with(&stranger);
    assert_eq!(
        fx.manager.store_policy(&tampered).unwrap_err(),
        SessionError::VerifyFail
    );

    assert_eq!(fx.manager.retrieve_policy(), install);
    assert_eq!(
        std::fs::read(&fx.paths.owner_key).unwrap(),
        public_key_blob(&first)
    );
    assert!(fx.emitter.emitted().is_empty());
}

#[tokio::test]
async fn enterprise_device_is_not_ownable() {
    let mut fx = fixture();
    let dm_key = generate_signing_key();

    let enrolled = PolicyBlob::device()
        .username("a@b")
        .request_token("enrollment-token")
        .sign_install(&dm_key);
    fx.manager
        .store_policy(&enrolled)
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    fx.manager.start_session("a@b").unwrap();
    assert_eq!(fx.manager.retrieve_session_state(), "started");

    // No mitigation, no key generation.
    assert!(fx.mitigations.try_recv().is_err());
    assert!(!fx.manager.supervisor().generator_running());
}

#[tokio::test]
async fn user_policy_requires_a_session() {
    let mut fx = fixture();
    let user_key = generate_signing_key();
    let blob = PolicyBlob::device().username("a@b").sign_install(&user_key);

    assert_eq!(
        fx.manager.store_policy_for_user("a@b", &blob).unwrap_err(),
        SessionError::NoSession
    );
    assert_eq!(
        fx.manager.retrieve_policy_for_user("a@b").unwrap_err(),
        SessionError::NoSession
    );

    fx.manager.start_session("a@b").unwrap();
    fx.manager
        .store_policy_for_user("A@B", &blob)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fx.manager.retrieve_policy_for_user("a@b").unwrap(), blob);
}

#[tokio::test]
async fn device_local_accounts_validate_under_the_owner_key() {
    let mut fx = fixture();
    let owner = generate_signing_key();
    let stranger = generate_signing_key();

    // Declare the account in device policy while installing the key.
    let settings = DeviceSettings {
        device_local_accounts: vec!["kiosk@app".into()],
        ..Default::default()
    };
    let install = PolicyBlob::device()
        .username("a@b")
        .settings(&settings)
        .sign_install(&owner);
    fx.manager
        .store_policy(&install)
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    // Owner-signed account policy is accepted and retrievable.
    let account_blob = PolicyBlob::device().sign_with(&owner);
    fx.manager
        .store_device_local_account_policy("kiosk@app", &account_blob)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        fx.manager
            .retrieve_device_local_account_policy("kiosk@app")
            .unwrap(),
        account_blob
    );

    // Unknown accounts and foreign signatures are refused.
    assert_eq!(
        fx.manager
            .store_device_local_account_policy("other@app", &account_blob)
            .unwrap_err(),
        SessionError::IllegalService
    );
    let foreign = PolicyBlob::device().sign_with(&stranger);
    assert_eq!(
        fx.manager
            .store_device_local_account_policy("kiosk@app", &foreign)
            .unwrap_err(),
        SessionError::VerifyFail
    );
}

#[tokio::test]
async fn start_up_flags_reach_the_browser_argv() {
    let mut fx = fixture();
    let owner = generate_signing_key();

    let settings = DeviceSettings {
        start_up_flags: vec!["feature-x".into(), "--feature-y".into()],
        ..Default::default()
    };
    let install = PolicyBlob::device()
        .username("a@b")
        .settings(&settings)
        .sign_install(&owner);
    fx.manager
        .store_policy(&install)
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    // The flags land wrapped in the policy-switches sentinels; spawn a
    // browser and make sure nothing panics with them applied.
    fx.manager.run_browser().unwrap();
    match fx.child_events.recv().await.unwrap() {
        ChildEvent::BrowserExited { status, .. } => assert!(status.success()),
        other => panic!("unexpected event: {other:?}"),
    }
}
