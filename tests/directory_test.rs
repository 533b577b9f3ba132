mod common;

use assert_matches::assert_matches;
use common::TestApp;
use deposit_api::{
    errors::ServiceError,
    services::directory::{CreateClientInput, CreateProductInput, CreateSiteInput},
};
use rust_decimal_macros::dec;
use uuid::Uuid;

fn client_input(name: &str) -> CreateClientInput {
    CreateClientInput {
        name: name.to_string(),
        tax_id: None,
    }
}

#[tokio::test]
async fn product_codes_are_unique() {
    let app = TestApp::new().await;
    let directory = app.state.services.directory.clone();
    let input = CreateProductInput {
        code: "rack-01".into(),
        name: "Rack".into(),
        unit_price: dec!(120),
    };

    let product = directory.create_product(input.clone()).await.unwrap();
    assert_eq!(product.code, "RACK-01");
    assert!(product.active);

    assert_matches!(
        directory.create_product(input).await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        directory
            .create_product(CreateProductInput {
                code: "neg".into(),
                name: "Negative".into(),
                unit_price: dec!(-1),
            })
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn sub_clients_hang_off_a_top_level_client() {
    let app = TestApp::new().await;
    let directory = app.state.services.directory.clone();

    let parent = directory.create_client(client_input("Parent")).await.unwrap();
    let child = directory
        .create_sub_client(parent.id, client_input("Child"))
        .await
        .unwrap();

    assert_eq!(child.code, "SUB-CLI-00001");
    assert_eq!(child.parent_id, Some(parent.id));
    assert!(child.is_sub_client());

    assert_matches!(
        directory.create_sub_client(child.id, client_input("Grandchild")).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        directory.create_sub_client(Uuid::new_v4(), client_input("Orphan")).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn site_sub_client_must_belong_to_the_client() {
    let app = TestApp::new().await;
    let directory = app.state.services.directory.clone();

    let a = directory.create_client(client_input("A")).await.unwrap();
    let b = directory.create_client(client_input("B")).await.unwrap();
    let b_child = directory
        .create_sub_client(b.id, client_input("B child"))
        .await
        .unwrap();

    let result = directory
        .create_site(CreateSiteInput {
            name: "Mismatched".into(),
            client_id: a.id,
            sub_client_id: Some(b_child.id),
            address: None,
        })
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));

    let site = directory
        .create_site(CreateSiteInput {
            name: "B yard".into(),
            client_id: b.id,
            sub_client_id: Some(b_child.id),
            address: None,
        })
        .await
        .unwrap();

    let joined = directory.client_for_site(site.id).await.unwrap();
    assert_eq!(joined.client.id, b.id);
    assert_eq!(joined.site.id, site.id);
    assert_matches!(
        directory.client_for_site(Uuid::new_v4()).await,
        Err(ServiceError::NotFound(_))
    );
}
