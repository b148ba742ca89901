use super::*;
use crate::db_types::{IncomingRow, RowValue};
use crate::destination::memory::MemoryDestination;
use crate::protocol::{encode_rows, split_payload};
use crate::schema::{FieldDefinition, FunctionDefinition, ParameterDefinition, SchemaEntry};
use crate::verification::CountMismatch;
use tokio::task::JoinHandle;

struct MemoryConnector(MemoryDestination);

#[async_trait]
impl DestinationConnector for MemoryConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn Destination>, String> {
        Ok(Arc::new(self.0.clone()))
    }
}

fn plain_field(name: &str) -> FieldDefinition {
    FieldDefinition {
        key: name.to_string(),
        value: name.to_string(),
        functions: vec![],
    }
}

fn schema_bytes() -> Vec<u8> {
    SchemaDefinition {
        entries: vec![
            SchemaEntry {
                name: "T".to_string(),
                query: "SELECT old_id, name FROM t".to_string(),
                fields: vec![
                    FieldDefinition {
                        key: "id".to_string(),
                        value: "old_id".to_string(),
                        functions: vec![FunctionDefinition {
                            name: "ToGuid".to_string(),
                            parameters: vec![ParameterDefinition::Literal(RowValue::from("T"))],
                        }],
                    },
                    plain_field("name"),
                ],
            },
            SchemaEntry {
                name: "U".to_string(),
                query: "SELECT code FROM u".to_string(),
                fields: vec![plain_field("code")],
            },
        ],
    }
    .to_bytes()
    .unwrap()
}

fn start_message(schema: Vec<u8>) -> ClientMessage {
    ClientMessage::Start {
        url: "postgres://localhost/target".to_string(),
        database: "postgres".to_string(),
        placeholder_style: PlaceholderStyle::Dollar,
        schema,
        plugin: Vec::new(),
    }
}

type Harness = (
    mpsc::Sender<ClientMessage>,
    mpsc::Receiver<ServerMessage>,
    JoinHandle<Result<VerificationReport, FlockError>>,
    Arc<IdentityCache>,
);

fn spawn_session(destination: &MemoryDestination) -> Harness {
    let server = FlockServer::with_builtins()
        .unwrap()
        .with_connector(Arc::new(MemoryConnector(destination.clone())));
    let identity = Arc::clone(server.identity());
    let (client_tx, mut client_rx) = mpsc::channel::<ClientMessage>(64);
    let (outbound, outbound_rx) = mpsc::channel(64);

    let handle = tokio::spawn(async move { server.run_session(&mut client_rx, outbound).await });
    (client_tx, outbound_rx, handle, identity)
}

fn t_rows(old_ids: &[i64]) -> Vec<IncomingRow> {
    old_ids
        .iter()
        .map(|old_id| {
            let mut row = IncomingRow::new();
            row.insert("old_id".to_string(), RowValue::Int(*old_id));
            row.insert("name".to_string(), RowValue::Text(format!("n{}", old_id)));
            row
        })
        .collect()
}

/// Sends one batch with its chunks in the given index order.
async fn send_batch(
    client: &mpsc::Sender<ClientMessage>,
    batch_id: &str,
    table: &str,
    rows: &[IncomingRow],
    chunk_order: Option<&[usize]>,
) {
    let payload = encode_rows(rows).unwrap();
    let chunks = split_payload(&payload, payload.len() / 3 + 1).unwrap();
    client
        .send(ClientMessage::BatchHead {
            batch_id: batch_id.to_string(),
            table_name: table.to_string(),
            dest_table_name: String::new(),
            chunk_count: chunks.len(),
        })
        .await
        .unwrap();
    let order = chunk_order
        .map(|order| order.to_vec())
        .unwrap_or_else(|| (0..chunks.len()).collect());
    for index in order {
        client
            .send(ClientMessage::BatchChunk {
                batch_id: batch_id.to_string(),
                index,
                payload: chunks[index].clone(),
            })
            .await
            .unwrap();
    }
    client
        .send(ClientMessage::BatchTail {
            batch_id: batch_id.to_string(),
        })
        .await
        .unwrap();
}

fn counts(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
    pairs.iter().map(|(t, c)| (t.to_string(), *c)).collect()
}

#[tokio::test]
async fn test_full_session_commits_and_keeps_identities_stable() {
    let destination = MemoryDestination::new();
    let (client, mut server_rx, handle, identity) = spawn_session(&destination);

    client.send(start_message(schema_bytes())).await.unwrap();
    assert_eq!(server_rx.recv().await, Some(ServerMessage::Pong));

    client.send(ClientMessage::Ping).await.unwrap();
    assert_eq!(server_rx.recv().await, Some(ServerMessage::Pong));

    send_batch(&client, "b1", "T", &t_rows(&[5, 5]), Some(&[2, 0, 1])).await;
    assert_eq!(
        server_rx.recv().await,
        Some(ServerMessage::BatchInsertResult {
            batch_id: "b1".to_string(),
            success: true,
        })
    );

    send_batch(&client, "b2", "T", &t_rows(&[7]), None).await;
    assert_eq!(
        server_rx.recv().await,
        Some(ServerMessage::BatchInsertResult {
            batch_id: "b2".to_string(),
            success: true,
        })
    );

    client
        .send(ClientMessage::End {
            record_counts: counts(&[("T", 3)]),
        })
        .await
        .unwrap();
    assert_eq!(
        server_rx.recv().await,
        Some(ServerMessage::SessionComplete {
            success: true,
            discrepancies: Vec::new(),
        })
    );

    let report = handle.await.unwrap().unwrap();
    assert!(report.is_clean());
    assert_eq!(destination.commits(), 1);
    assert_eq!(destination.rollbacks(), 0);

    let committed = destination.committed();
    let first = &committed[0].params;
    // Two rows of two bound values each: [id, name, id, name].
    assert_eq!(first[0], first[2]);
    let five = identity.lookup("T", "5").unwrap().unwrap();
    let seven = identity.lookup("T", "7").unwrap().unwrap();
    assert_eq!(first[0], RowValue::Text(five.clone()));
    assert_ne!(five, seven);
    assert_eq!(committed[1].params[0], RowValue::Text(seven));
}

#[tokio::test]
async fn test_message_before_start_is_version_mismatch() {
    let destination = MemoryDestination::new();
    let (client, _server_rx, handle, _) = spawn_session(&destination);

    client.send(ClientMessage::Ping).await.unwrap();
    let error = handle.await.unwrap().unwrap_err();
    assert!(matches!(error, FlockError::Protocol(ref message) if message.contains("version mismatch")));
    assert_eq!(destination.commits() + destination.rollbacks(), 0);
}

#[tokio::test]
async fn test_unknown_message_aborts_and_rolls_back() {
    let destination = MemoryDestination::new();
    let (client, mut server_rx, handle, _) = spawn_session(&destination);

    client.send(start_message(schema_bytes())).await.unwrap();
    assert_eq!(server_rx.recv().await, Some(ServerMessage::Pong));
    client.send(ClientMessage::Unknown).await.unwrap();

    assert!(matches!(handle.await.unwrap(), Err(FlockError::Protocol(_))));
    assert_eq!(destination.rollbacks(), 1);
    assert_eq!(destination.commits(), 0);
}

#[tokio::test]
async fn test_end_with_open_batch_is_rejected() {
    let destination = MemoryDestination::new();
    let (client, mut server_rx, handle, _) = spawn_session(&destination);

    client.send(start_message(schema_bytes())).await.unwrap();
    assert_eq!(server_rx.recv().await, Some(ServerMessage::Pong));
    client
        .send(ClientMessage::BatchHead {
            batch_id: "b1".to_string(),
            table_name: "T".to_string(),
            dest_table_name: String::new(),
            chunk_count: 2,
        })
        .await
        .unwrap();
    client
        .send(ClientMessage::End {
            record_counts: HashMap::new(),
        })
        .await
        .unwrap();

    let error = handle.await.unwrap().unwrap_err();
    assert!(matches!(error, FlockError::Protocol(ref message) if message.contains("still open")));
    assert_eq!(destination.commits(), 0);
    assert_eq!(destination.rollbacks(), 1);
}

#[tokio::test]
async fn test_one_failing_batch_aborts_the_session() {
    let destination = MemoryDestination::new().failing_on("U");
    let (client, mut server_rx, handle, _) = spawn_session(&destination);

    client.send(start_message(schema_bytes())).await.unwrap();
    assert_eq!(server_rx.recv().await, Some(ServerMessage::Pong));

    send_batch(&client, "t1", "T", &t_rows(&[1, 2, 3]), None).await;
    let mut u_row = IncomingRow::new();
    u_row.insert("code".to_string(), RowValue::from("x"));
    send_batch(&client, "u1", "U", &[u_row], None).await;

    // No End: the session notices the failure on its own.
    let error = handle.await.unwrap().unwrap_err();
    assert!(matches!(error, FlockError::Persistence(_)));
    assert_eq!(destination.commits(), 0);
    assert_eq!(destination.rollbacks(), 1);
    assert!(destination.committed().is_empty());
    drop(client);
}

#[tokio::test]
async fn test_count_mismatch_is_reported_after_commit() {
    let destination = MemoryDestination::new().with_count("T", 98);
    let (client, mut server_rx, handle, _) = spawn_session(&destination);

    client.send(start_message(schema_bytes())).await.unwrap();
    assert_eq!(server_rx.recv().await, Some(ServerMessage::Pong));
    client
        .send(ClientMessage::End {
            record_counts: counts(&[("T", 100)]),
        })
        .await
        .unwrap();

    let expected = vec![CountMismatch {
        table: "T".to_string(),
        expected: 100,
        found: 98,
    }];
    assert_eq!(
        server_rx.recv().await,
        Some(ServerMessage::SessionComplete {
            success: true,
            discrepancies: expected.clone(),
        })
    );
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.mismatches, expected);
    assert_eq!(destination.commits(), 1);
}

#[tokio::test]
async fn test_start_rejects_unregistered_function() {
    let destination = MemoryDestination::new();
    let (client, _server_rx, handle, _) = spawn_session(&destination);

    let schema = SchemaDefinition {
        entries: vec![SchemaEntry {
            name: "T".to_string(),
            query: String::new(),
            fields: vec![FieldDefinition {
                key: "id".to_string(),
                value: "id".to_string(),
                functions: vec![FunctionDefinition {
                    name: "Reverse".to_string(),
                    parameters: vec![],
                }],
            }],
        }],
    };
    client.send(start_message(schema.to_bytes().unwrap())).await.unwrap();

    assert!(matches!(handle.await.unwrap(), Err(FlockError::Startup(_))));
    assert_eq!(destination.commits() + destination.rollbacks(), 0);
}

#[tokio::test]
async fn test_start_rejects_unknown_driver_and_plugin_payload() {
    let destination = MemoryDestination::new();
    let (client, _server_rx, handle, _) = spawn_session(&destination);
    client
        .send(ClientMessage::Start {
            url: "oracle://db".to_string(),
            database: "oracle".to_string(),
            placeholder_style: PlaceholderStyle::Question,
            schema: schema_bytes(),
            plugin: Vec::new(),
        })
        .await
        .unwrap();
    assert!(matches!(handle.await.unwrap(), Err(FlockError::Startup(_))));

    let (client, _server_rx, handle, _) = spawn_session(&destination);
    client
        .send(ClientMessage::Start {
            url: "postgres://localhost/target".to_string(),
            database: "postgres".to_string(),
            placeholder_style: PlaceholderStyle::Dollar,
            schema: schema_bytes(),
            plugin: b"package main".to_vec(),
        })
        .await
        .unwrap();
    assert!(matches!(handle.await.unwrap(), Err(FlockError::Startup(_))));
}

#[tokio::test]
async fn test_disconnect_mid_session_rolls_back() {
    let destination = MemoryDestination::new();
    let (client, mut server_rx, handle, _) = spawn_session(&destination);

    client.send(start_message(schema_bytes())).await.unwrap();
    assert_eq!(server_rx.recv().await, Some(ServerMessage::Pong));
    send_batch(&client, "b1", "T", &t_rows(&[1]), None).await;
    drop(client);

    assert!(matches!(handle.await.unwrap(), Err(FlockError::Transport(_))));
    assert_eq!(destination.commits(), 0);
    assert_eq!(destination.rollbacks(), 1);
}
