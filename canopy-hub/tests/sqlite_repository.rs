use canopy_core::{Device, DeviceId, DeviceKind, FarmId};
use canopy_hub::registry::{DeviceRepository, SqliteDeviceRepository};
use jiff::{SignedDuration, Timestamp};
use tempfile::NamedTempFile;

fn device(id: &str, registered_at: Timestamp) -> Device {
    Device {
        id: DeviceId::from(id),
        kind: DeviceKind::Coordinator,
        farm_id: FarmId::from("farm-1"),
        name: format!("Coordinator {id}").into(),
        description: Some("rooftop".into()),
        color: None,
        tags: Box::new(["hydro".into()]),
        location: None,
        registered_at,
    }
}

#[tokio::test]
async fn upsert_get_all_and_delete() {
    let repository = SqliteDeviceRepository::new_in_memory().await.unwrap();
    let now = Timestamp::now();

    repository
        .upsert(&device("c2", now))
        .await
        .unwrap();
    repository
        .upsert(&device("c1", now - SignedDuration::from_hours(1)))
        .await
        .unwrap();

    let all = repository.get_all().await.unwrap();
    let ids: Vec<_> = all.iter().map(|d| d.id.clone()).collect();
    assert_eq!(ids, vec![DeviceId::from("c1"), DeviceId::from("c2")]);
    assert_eq!(all[0].tags.len(), 1);

    assert!(repository.delete(&DeviceId::from("c1")).await.unwrap());
    assert!(!repository.delete(&DeviceId::from("c1")).await.unwrap());
    assert_eq!(repository.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn upsert_replaces_existing_document() {
    let repository = SqliteDeviceRepository::new_in_memory().await.unwrap();
    let mut stored = device("c1", Timestamp::now());
    repository.upsert(&stored).await.unwrap();

    stored.name = "Renamed".into();
    stored.farm_id = FarmId::from("farm-2");
    repository.upsert(&stored).await.unwrap();

    let all = repository.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(&*all[0].name, "Renamed");
    assert_eq!(all[0].farm_id, FarmId::from("farm-2"));
}

#[tokio::test]
async fn devices_survive_reopen() {
    let file = NamedTempFile::new().unwrap();

    {
        let repository = SqliteDeviceRepository::new(file.path()).await.unwrap();
        repository
            .upsert(&device("c1", Timestamp::now()))
            .await
            .unwrap();
    }

    let reopened = SqliteDeviceRepository::new(file.path()).await.unwrap();
    let all = reopened.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, DeviceId::from("c1"));
}
