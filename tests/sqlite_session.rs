//! Session behaviour against a file-backed SQLite data source

use chrono::{NaiveDateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use sqlweave::prelude::*;
use sqlweave::schema::InMemorySequenceSource;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Debug, Clone, Default, PartialEq)]
struct Owner {
    id: i64,
    name: String,
}

impl Entity for Owner {
    fn define() -> EntityDef<Self> {
        EntityDef::table("owner")
            .id("id", ColumnType::Long, |o: &Owner| &o.id, |o| &mut o.id)
            .field("name", ColumnType::String, |o| &o.name, |o| &mut o.name)
            .length(64)
            .unique("owner_name", &["name"])
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Account {
    id: i64,
    owner_id: i64,
    owner_name: Option<String>,
    balance: i64,
    version: i64,
    entries: Vec<Entry>,
    note: Option<Note>,
}

impl Entity for Account {
    fn define() -> EntityDef<Self> {
        EntityDef::table("account")
            .id("id", ColumnType::Long, |a: &Account| &a.id, |a| &mut a.id)
            .field("owner_id", ColumnType::Long, |a| &a.owner_id, |a| &mut a.owner_id)
            .references::<Owner>()
            .list_only(
                "owner_name",
                ColumnType::String,
                "owner_id",
                "name",
                |a| &a.owner_name,
                |a| &mut a.owner_name,
            )
            .field("balance", ColumnType::Long, |a| &a.balance, |a| &mut a.balance)
            .version("version", ColumnType::Long, |a| &a.version, |a| &mut a.version)
            .child_list("entries", "account_id", |a: &mut Account| &mut a.entries)
            .child("note", "account_id", |a: &mut Account| &mut a.note)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Entry {
    id: i64,
    account_id: i64,
    amount: i64,
    created: Option<NaiveDateTime>,
}

impl Entity for Entry {
    fn define() -> EntityDef<Self> {
        EntityDef::table("entry")
            .policy(Arc::new(
                SequencedEntityPolicy::new(Arc::new(InMemorySequenceSource::new()))
                    .created_at("created"),
            ))
            .id("id", ColumnType::Long, |e: &Entry| &e.id, |e| &mut e.id)
            .field("account_id", ColumnType::Long, |e| &e.account_id, |e| &mut e.account_id)
            .references::<Account>()
            .field("amount", ColumnType::Long, |e| &e.amount, |e| &mut e.amount)
            .field("created", ColumnType::TimestampUtc, |e| &e.created, |e| &mut e.created)
            .nullable()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Note {
    id: i64,
    account_id: i64,
    text: String,
}

impl Entity for Note {
    fn define() -> EntityDef<Self> {
        EntityDef::table("note")
            .id("id", ColumnType::Long, |n: &Note| &n.id, |n| &mut n.id)
            .field("account_id", ColumnType::Long, |n| &n.account_id, |n| &mut n.account_id)
            .references::<Account>()
            .field("text", ColumnType::Text, |n| &n.text, |n| &mut n.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Locker {
    id: i64,
    label: String,
    removed_at: Option<NaiveDateTime>,
}

/// (id, label, had database time) for every delete the policy saw
static REMOVALS: Mutex<Vec<(i64, String, bool)>> = Mutex::new(Vec::new());
static FAILED_REMOVALS: Mutex<Vec<i64>> = Mutex::new(Vec::new());

struct RemovalAudit;

impl EntityPolicy for RemovalAudit {
    fn pre_delete(&self, record: &mut EntityRecord<'_>, now: Option<NaiveDateTime>) -> Result<()> {
        let id: i64 = record.get_as("id")?;
        let label: String = record.get_as("label")?;
        REMOVALS.lock().unwrap().push((id, label, now.is_some()));
        record.set("removed_at", now.map(SqlValue::from).unwrap_or(SqlValue::Null))
    }

    fn on_delete_error(&self, record: &EntityRecord<'_>, _error: &Error) {
        if let Ok(id) = record.get_as::<i64>("id") {
            FAILED_REMOVALS.lock().unwrap().push(id);
        }
    }

    fn is_set_now(&self) -> bool {
        true
    }
}

impl Entity for Locker {
    fn define() -> EntityDef<Self> {
        EntityDef::table("locker")
            .policy(Arc::new(RemovalAudit))
            .id("id", ColumnType::Long, |l: &Locker| &l.id, |l| &mut l.id)
            .field("label", ColumnType::String, |l| &l.label, |l| &mut l.label)
            .length(16)
            .field("removed_at", ColumnType::Timestamp, |l| &l.removed_at, |l| &mut l.removed_at)
            .nullable()
    }
}

async fn bank() -> (TempDir, Arc<dyn DataSource>) {
    let dir = TempDir::new().unwrap();
    let config = DataSourceConfig::builder("bank")
        .url(format!("sqlite://{}?mode=rwc", dir.path().join("bank.db").display()))
        .max_connections(2)
        .build()
        .unwrap();
    let data_source = create_data_source(&config).unwrap();

    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    session.create_schema::<Owner>().await.unwrap();
    session.create_schema::<Account>().await.unwrap();
    session.create_schema::<Entry>().await.unwrap();
    session.create_schema::<Note>().await.unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();
    (dir, data_source)
}

fn account(id: i64, owner_id: i64, balance: i64) -> Account {
    Account {
        id,
        owner_id,
        balance,
        ..Default::default()
    }
}

fn entry(amount: i64) -> Entry {
    Entry {
        amount,
        ..Default::default()
    }
}

/// Two owners and three accounts: Ada holds 10 and 11, Bob holds 12
async fn seed(session: &mut DatabaseSession) {
    for (id, name) in [(1, "Ada"), (2, "Bob")] {
        session
            .create(&mut Owner {
                id,
                name: name.to_string(),
            })
            .await
            .unwrap();
    }
    for (id, owner, balance) in [(10, 1, 100), (11, 1, 200), (12, 2, 300)] {
        session.create(&mut account(id, owner, balance)).await.unwrap();
    }
}

#[tokio::test]
async fn test_create_and_find_with_children() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let mut acc = account(20, 1, 50);
    acc.entries = vec![entry(5), entry(7)];
    acc.note = Some(Note {
        id: 1,
        text: "vip".to_string(),
        ..Default::default()
    });
    let id = session.create(&mut acc).await.unwrap();
    assert_eq!(id, SqlValue::BigInt(20));
    assert_eq!(acc.version, 1);
    assert!(acc.entries.iter().all(|e| e.account_id == 20));
    assert!(acc.entries.iter().all(|e| e.id > 0 && e.created.is_some()));
    session.commit().await.unwrap();

    let found: Account = session.find(20i64).await.unwrap();
    assert_eq!(found.balance, 50);
    assert_eq!(
        found.entries.iter().map(|e| e.amount).collect::<Vec<_>>(),
        vec![5, 7]
    );
    assert_eq!(found.note.as_ref().map(|n| n.text.as_str()), Some("vip"));
    assert_eq!(found.owner_name, None);

    let lean: Account = session.find_lean(20i64).await.unwrap();
    assert!(lean.entries.is_empty());
    assert!(lean.note.is_none());

    let listed: Account = session.list(20i64).await.unwrap();
    assert_eq!(listed.owner_name.as_deref(), Some("Ada"));
    assert_eq!(listed.entries.len(), 2);

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_table_and_view_reads_agree() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let query = Query::<Account>::new()
        .where_gt("balance", 50i64)
        .order_by("id", OrderDirection::Asc);
    let from_table = session.find_all(&query).await.unwrap();
    let from_view = session.list_all(&query).await.unwrap();

    let key = |a: &Account| (a.id, a.owner_id, a.balance, a.version);
    assert_eq!(from_table.len(), 3);
    assert_eq!(
        from_table.iter().map(key).collect::<Vec<_>>(),
        from_view.iter().map(key).collect::<Vec<_>>()
    );
    assert!(from_table.iter().all(|a| a.owner_name.is_none()));
    assert_eq!(
        from_view
            .iter()
            .map(|a| a.owner_name.clone().unwrap_or_default())
            .collect::<Vec<_>>(),
        vec!["Ada", "Ada", "Bob"]
    );

    // restricting on a list-only field routes the find through the view
    let by_owner = Query::<Account>::new().where_eq("owner_name", "Bob");
    let bob = session.find_all(&by_owner).await.unwrap();
    assert_eq!(bob.iter().map(|a| a.id).collect::<Vec<_>>(), vec![12]);

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_delete_cascades_to_children() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let mut acc = account(20, 1, 50);
    acc.entries = vec![entry(1), entry(2), entry(3)];
    acc.note = Some(Note {
        id: 1,
        text: "closing".to_string(),
        ..Default::default()
    });
    session.create(&mut acc).await.unwrap();

    let mut other = account(21, 2, 60);
    other.entries = vec![entry(4)];
    session.create(&mut other).await.unwrap();

    let all_entries = Query::<Entry>::new();
    assert_eq!(session.count(&all_entries).await.unwrap(), 4);

    assert_eq!(session.delete::<Account>(20i64).await.unwrap(), 1);
    assert_eq!(session.count(&all_entries).await.unwrap(), 1);
    assert_eq!(session.count(&Query::<Note>::new()).await.unwrap(), 0);

    // list-only restriction: ids are selected through the view first
    let bobs = Query::<Account>::new().where_eq("owner_name", "Bob");
    assert_eq!(session.delete_all(&bobs).await.unwrap(), 2);
    assert_eq!(session.count(&all_entries).await.unwrap(), 0);
    assert_eq!(session.count(&Query::<Account>::new()).await.unwrap(), 2);

    let missing = session.delete::<Account>(99i64).await.unwrap_err();
    assert!(matches!(missing, Error::RecordNotFound { .. }));

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_optimistic_locking() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let mut fresh: Account = session.find_lean(10i64).await.unwrap();
    let mut stale = fresh.clone();
    assert_eq!(fresh.version, 1);

    fresh.balance = 150;
    assert_eq!(session.update_lean_by_id_version(&mut fresh).await.unwrap(), 1);
    assert_eq!(fresh.version, 2);

    stale.balance = 175;
    let err = session
        .update_lean_by_id_version(&mut stale)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordVersionMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::OptimisticLock);
    assert_eq!(stale.version, 1);

    let reread: Account = session.find_version(10i64, 2i64).await.unwrap();
    assert_eq!(reread.balance, 150);
    assert!(matches!(
        session.find_version::<Account>(10i64, 1i64).await.unwrap_err(),
        Error::RecordVersionMismatch { .. }
    ));
    assert!(matches!(
        session.find::<Account>(99i64).await.unwrap_err(),
        Error::RecordNotFound { .. }
    ));
    assert!(matches!(
        session.delete_by_id_version(&mut stale).await.unwrap_err(),
        Error::RecordVersionMismatch { .. }
    ));
    assert_eq!(session.delete_by_id_version(&mut fresh).await.unwrap(), 1);

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_update_replaces_children() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let mut acc = account(20, 1, 50);
    acc.entries = vec![entry(1), entry(2)];
    session.create(&mut acc).await.unwrap();

    acc.entries = vec![entry(9)];
    acc.balance = 70;
    assert_eq!(session.update_by_id(&mut acc).await.unwrap(), 1);

    let found: Account = session.find(20i64).await.unwrap();
    assert_eq!(found.balance, 70);
    assert_eq!(
        found.entries.iter().map(|e| e.amount).collect::<Vec<_>>(),
        vec![9]
    );

    let update = Update::new().set("balance", 0i64);
    assert_eq!(session.update_by_id_with::<Account>(20i64, &update).await.unwrap(), 1);
    let rich = Query::<Account>::new().where_gte("balance", 200i64);
    assert_eq!(session.update_all(&rich, &update).await.unwrap(), 2);
    let adas = Query::<Account>::new().where_eq("owner_name", "Ada");
    let bump = Update::new().set("balance", 5i64);
    assert_eq!(session.update_all(&adas, &bump).await.unwrap(), 3);

    let balances: Vec<i64> = session
        .value_list("balance", &Query::<Account>::new().order_by("id", OrderDirection::Asc))
        .await
        .unwrap();
    assert_eq!(balances, vec![5, 5, 0, 5]);

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_savepoints_and_transactions() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;
    session.commit().await.unwrap();

    let accounts = Query::<Account>::new();
    session.set_savepoint().await.unwrap();
    session.create(&mut account(13, 2, 1)).await.unwrap();
    assert_eq!(session.count(&accounts).await.unwrap(), 4);

    session.rollback_to_savepoint().await.unwrap();
    assert_eq!(session.count(&accounts).await.unwrap(), 3);

    session.create(&mut account(14, 2, 1)).await.unwrap();
    session.clear_savepoint().await.unwrap();
    session.commit().await.unwrap();

    session.create(&mut account(15, 2, 1)).await.unwrap();
    session.rollback().await.unwrap();
    session.close().await.unwrap();

    // uncommitted work never reaches another session
    let mut reader = DatabaseSession::open(data_source.clone()).await.unwrap();
    let ids: Vec<i64> = reader
        .value_list("id", &accounts.clone().order_by("id", OrderDirection::Asc))
        .await
        .unwrap();
    assert_eq!(ids, vec![10, 11, 12, 14]);
    reader.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_closed_session() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    assert_eq!(session.data_source_name(), "bank");

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(session.is_closed());

    let err = session.find::<Account>(1i64).await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
    assert!(matches!(session.commit().await.unwrap_err(), Error::SessionClosed));
    assert!(matches!(
        session.set_savepoint().await.unwrap_err(),
        Error::SessionClosed
    ));
    data_source.terminate().await;
}

#[tokio::test]
async fn test_amongst_beyond_dialect_limit() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();

    let ids: Vec<i64> = (0..1000).collect();
    let query = Query::<Account>::new().where_in("id", ids);
    match session.find_all(&query).await.unwrap_err() {
        Error::TooManyClauseValues { count, max, .. } => {
            assert_eq!(count, 1000);
            assert_eq!(max, 999);
        }
        other => panic!("unexpected error: {other}"),
    }

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_unique_constraint_lookup_and_list_only_population() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let clash = Owner {
        id: 3,
        name: "Ada".to_string(),
    };
    let found = session.find_constraint(&clash).await.unwrap();
    assert_eq!(found.map(|o| o.id), Some(1));

    let unique = Owner {
        id: 3,
        name: "Cy".to_string(),
    };
    assert!(session.find_constraint(&unique).await.unwrap().is_none());

    let mut acc = account(30, 2, 0);
    session.populate_list_only(&mut acc).await.unwrap();
    assert_eq!(acc.owner_name.as_deref(), Some("Bob"));

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_values_maps_and_aggregates() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let all = Query::<Account>::new().order_by("id", OrderDirection::Asc);

    let balances: IndexMap<i64, i64> = session.value_map("id", "balance", &all).await.unwrap();
    assert_eq!(balances.get(&12), Some(&300));

    let by_owner: IndexMap<i64, Vec<i64>> = session
        .value_list_map("owner_id", "id", &all)
        .await
        .unwrap();
    assert_eq!(by_owner.get(&1), Some(&vec![10, 11]));

    let owners: IndexSet<i64> = session.value_set("owner_id", &all).await.unwrap();
    assert_eq!(owners.into_iter().collect::<Vec<_>>(), vec![1, 2]);

    let name: Option<String> = session
        .value("owner_name", &Query::<Account>::new().where_eq("id", 12i64))
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("Bob"));

    let max: Option<i64> = session.max("balance", &all).await.unwrap();
    let min: Option<i64> = session
        .min("balance", &Query::<Account>::new().where_gt("balance", 1000i64))
        .await
        .unwrap();
    assert_eq!(max, Some(300));
    assert_eq!(min, None);

    let keyed = session.find_all_map::<i64, Account>("id", &all).await.unwrap();
    assert_eq!(keyed.keys().copied().collect::<Vec<_>>(), vec![10, 11, 12]);
    let grouped = session
        .list_all_list_map::<String, Account>("owner_name", &all)
        .await
        .unwrap();
    assert_eq!(grouped.get("Ada").map(Vec::len), Some(2));
    assert!(matches!(
        session
            .find_all_map::<i64, Account>("owner_id", &all)
            .await
            .unwrap_err(),
        Error::DuplicateKeyFound { .. }
    ));

    let totals = session
        .aggregate_many(
            &[
                AggregateFunction::sum("balance"),
                AggregateFunction::maximum("balance"),
            ],
            &Query::<Account>::new(),
        )
        .await
        .unwrap();
    assert_eq!(totals.len(), 2);
    assert_eq!(totals[0].count, 3);
    assert_eq!(totals[0].value.as_f64(), Some(600.0));
    assert_eq!(totals[1].value.as_i64(), Some(300));

    // the view is needed for the restriction, so ids are resolved first
    let ada_total = session
        .aggregate(
            AggregateFunction::sum("balance"),
            &Query::<Account>::new().where_eq("owner_name", "Ada"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ada_total.count, 2);
    assert_eq!(ada_total.value.as_f64(), Some(300.0));

    let nobody = session
        .aggregate(
            AggregateFunction::sum("balance"),
            &Query::<Account>::new().where_eq("owner_name", "Zed"),
        )
        .await
        .unwrap();
    assert!(nobody.is_none());

    let per_owner = session
        .aggregate_group_many(
            &[AggregateFunction::sum("balance")],
            &Query::<Account>::new().group_by("owner_id"),
        )
        .await
        .unwrap();
    let mut pairs: Vec<(i64, u64)> = per_owner
        .iter()
        .map(|g| (g.group[0].as_i64().unwrap(), g.aggregations[0].count))
        .collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![(1, 2), (2, 1)]);

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_database_time() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();

    let now = session.now().await.unwrap();
    let drift = (Utc::now().naive_utc() - now).num_seconds().abs();
    assert!(drift < 60, "database time drifted {drift}s");

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_failed_create_keeps_caller_version() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;

    let mut duplicate = account(10, 2, 1);
    assert_eq!(duplicate.version, 0);
    assert!(session.create(&mut duplicate).await.is_err());
    assert_eq!(duplicate.version, 0);

    let mut fresh = account(13, 2, 1);
    session.create(&mut fresh).await.unwrap();
    assert_eq!(fresh.version, 1);

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_delete_hooks_receive_the_record() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    session.create_schema::<Locker>().await.unwrap();

    let mut north = Locker {
        id: 1,
        label: "north".to_string(),
        removed_at: None,
    };
    session.create(&mut north).await.unwrap();
    assert_eq!(session.delete_by_id(&mut north).await.unwrap(), 1);
    assert!(north.removed_at.is_some());

    let mut south = Locker {
        id: 2,
        label: "south".to_string(),
        removed_at: None,
    };
    assert!(matches!(
        session.delete_by_id(&mut south).await.unwrap_err(),
        Error::RecordNotFound { .. }
    ));

    // deleting by id alone has no record to hand over
    session
        .create(&mut Locker {
            id: 3,
            label: "east".to_string(),
            removed_at: None,
        })
        .await
        .unwrap();
    assert_eq!(session.delete::<Locker>(3i64).await.unwrap(), 1);

    assert_eq!(
        *REMOVALS.lock().unwrap(),
        vec![(1, "north".to_string(), true), (2, "south".to_string(), true)]
    );
    assert_eq!(*FAILED_REMOVALS.lock().unwrap(), vec![2]);

    session.close().await.unwrap();
    data_source.terminate().await;
}

#[tokio::test]
async fn test_paginated_bulk_writes_touch_one_page() {
    let (_dir, data_source) = bank().await;
    let mut session = DatabaseSession::open(data_source.clone()).await.unwrap();
    seed(&mut session).await;
    for (account_id, amount) in [(10, 1), (11, 2), (11, 3)] {
        session
            .create(&mut Entry {
                account_id,
                amount,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let second = Query::<Account>::new()
        .order_by("id", OrderDirection::Asc)
        .offset(1)
        .limit(1);
    let update = Update::new().set("balance", 0i64);
    assert_eq!(session.update_all(&second, &update).await.unwrap(), 1);

    let by_id = Query::<Account>::new().order_by("id", OrderDirection::Asc);
    let balances: Vec<i64> = session.value_list("balance", &by_id).await.unwrap();
    assert_eq!(balances, vec![100, 0, 300]);

    assert_eq!(session.delete_all(&second).await.unwrap(), 1);
    let ids: Vec<i64> = session.value_list("id", &by_id).await.unwrap();
    assert_eq!(ids, vec![10, 12]);
    let owners: Vec<i64> = session
        .value_list("account_id", &Query::<Entry>::new())
        .await
        .unwrap();
    assert_eq!(owners, vec![10]);

    // pagination does not narrow a count
    assert_eq!(session.count(&by_id.clone().limit(1)).await.unwrap(), 2);

    session.close().await.unwrap();
    data_source.terminate().await;
}
