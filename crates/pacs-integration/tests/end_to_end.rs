//! 端到端场景：通过生命周期管理器驱动真实的回环连接

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pacs_core::ClinicalStore;
use pacs_dicom::dimse::{status, CommandSet, CommandType};
use pacs_dicom::pdu::{AssociateRequest, ProposedPresentationContext, UserInformation, APPLICATION_CONTEXT_NAME};
use pacs_dicom::scu::ScuAssociation;
use pacs_dicom::transfer_syntax::{sop_class_uids, transfer_syntax_uids};
use pacs_integration::hl7::{self, build_ack};
use pacs_integration::{
    AckCode, ConnectionState, DefaultConnectorFactory, DicomEndpointConfig, EndpointConfig, Hl7Message,
    Hl7Segment, Hl7TransportConfig, LifecycleManager, MessageHeader, MllpCodec, TracingNotifier,
};
use pacs_storage::FileStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

async fn manager(store: Arc<dyn ClinicalStore>) -> Arc<LifecycleManager> {
    let factory = DefaultConnectorFactory::new(store, Arc::new(TracingNotifier));
    Arc::new(LifecycleManager::new(Arc::new(factory)))
}

#[tokio::test]
async fn oru_with_generated_control_id_is_acknowledged() {
    let data = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(data.path()).await.unwrap());
    let manager = manager(store).await;

    let ris = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = ris.local_addr().unwrap().port();
    let ris_task = tokio::spawn(async move {
        let (stream, _) = ris.accept().await.unwrap();
        let mut framed = Framed::new(stream, MllpCodec::new());
        let frame = framed.next().await.unwrap().unwrap();
        let message = hl7::decode(&frame).unwrap();

        let ack = build_ack(&message, AckCode::AA, "RIS000001", None);
        framed
            .send(Bytes::from(hl7::to_er7(&ack, &MessageHeader::default())))
            .await
            .unwrap();
        (message, frame)
    });

    manager
        .register_endpoint(EndpointConfig::hl7("ris-main", Hl7TransportConfig::new("127.0.0.1", port)))
        .await
        .unwrap();
    assert_eq!(
        manager.status("ris-main").await.unwrap().state,
        ConnectionState::Connected
    );

    let client = manager.hl7_client("ris-main").await.unwrap();
    let report = Hl7Message::new("ORU^R01", "")
        .with_segment(Hl7Segment::from_fields("PID", &["1", "", "PAT12345^^^HOSP^MR", "", "DOE^JOHN"]))
        .with_segment(Hl7Segment::from_fields("OBR", &["1", "ORD001", "", "71020^CHEST XRAY"]))
        .with_segment(Hl7Segment::from_fields("OBX", &["1", "TX", "IMPRESSION", "", "No acute findings"]));

    let ack = client.send_message(report).await.unwrap();
    let msa = ack.segment("MSA").unwrap();
    assert_eq!(msa.field(1), "AA");
    assert_eq!(msa.field(2), "AXIS000001");

    let (sent, frame) = ris_task.await.unwrap();
    assert_eq!(sent.control_id, "AXIS000001");
    assert_eq!(sent.message_type, "ORU^R01");
    assert!(frame.starts_with(b"MSH|^~\\&|PACS|HOSPITAL|RIS|HOSPITAL|"));
    assert_eq!(client.pending_count(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn inbound_order_is_persisted_as_clinical_event() {
    let data = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(data.path()).await.unwrap());
    let manager = manager(store).await;

    let ris = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = ris.local_addr().unwrap().port();
    let registration = manager.register_endpoint(EndpointConfig::hl7(
        "ris-main",
        Hl7TransportConfig::new("127.0.0.1", port),
    ));
    let (registered, accepted) = tokio::join!(registration, ris.accept());
    registered.unwrap();
    let mut peer = Framed::new(accepted.unwrap().0, MllpCodec::new());

    let order = Hl7Message::new("ORM^O01", "RIS4711")
        .with_segment(Hl7Segment::from_fields("PID", &["1", "", "PAT777"]))
        .with_segment(Hl7Segment::from_fields("ORC", &["NW", "ORD42"]))
        .with_segment(Hl7Segment::from_fields("OBR", &["1", "ORD42", "", "74150^CT ABDOMEN"]));
    peer.send(Bytes::from(hl7::to_er7(&order, &MessageHeader::default())))
        .await
        .unwrap();

    let ack = hl7::decode(&peer.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(ack.segment("MSA").unwrap().field(2), "RIS4711");

    let events_file = data.path().join("events/newOrder.jsonl");
    let mut content = String::new();
    for _ in 0..100 {
        if let Ok(text) = tokio::fs::read_to_string(&events_file).await {
            if !text.is_empty() {
                content = text;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let event: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(event["patient_ref"], "PAT777");
    assert_eq!(event["control_id"], "RIS4711");
    assert_eq!(event["source_endpoint"], "ris-main");

    manager.shutdown().await;
}

fn element(group: u16, element: u16, vr: &[u8; 2], value: &str) -> Vec<u8> {
    let mut value = value.as_bytes().to_vec();
    if value.len() % 2 == 1 {
        value.push(if vr == b"UI" { 0 } else { b' ' });
    }
    let mut out = Vec::new();
    out.extend_from_slice(&group.to_le_bytes());
    out.extend_from_slice(&element.to_le_bytes());
    out.extend_from_slice(vr);
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(&value);
    out
}

fn ct_dataset() -> Vec<u8> {
    [
        element(0x0008, 0x0016, b"UI", sop_class_uids::CT_IMAGE_STORAGE),
        element(0x0008, 0x0018, b"UI", "1.2.826.0.1.3680043.2.1125.1.3"),
        element(0x0008, 0x0060, b"CS", "CT"),
        element(0x0010, 0x0020, b"LO", "PAT12345"),
        element(0x0020, 0x000D, b"UI", "1.2.826.0.1.3680043.2.1125.1"),
        element(0x0020, 0x000E, b"UI", "1.2.826.0.1.3680043.2.1125.1.2"),
    ]
    .concat()
}

#[tokio::test]
async fn modality_store_lands_in_file_store() {
    let data = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(data.path()).await.unwrap());
    let manager = manager(store).await;

    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let mut listener = DicomEndpointConfig::new(port);
    listener.bind_host = "127.0.0.1".to_string();
    listener.ae_title = "GATEWAY".to_string();
    manager
        .register_endpoint(EndpointConfig::dicom("modality-in", listener))
        .await
        .unwrap();
    assert_eq!(
        manager.status("modality-in").await.unwrap().state,
        ConnectionState::Connected
    );

    let connector = manager.connector("modality-in").await.unwrap();
    connector.health_check(Duration::from_secs(5)).await.unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = AssociateRequest {
        protocol_version: 1,
        called_ae_title: "GATEWAY".to_string(),
        calling_ae_title: "CT_SCANNER".to_string(),
        application_context: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![ProposedPresentationContext {
            id: 1,
            abstract_syntax: sop_class_uids::CT_IMAGE_STORAGE.to_string(),
            transfer_syntaxes: vec![transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string()],
        }],
        user_information: UserInformation::default(),
    };
    let mut association = ScuAssociation::establish(stream, request).await.unwrap();
    let context_id = association.accepted_context().unwrap();

    let dataset = ct_dataset();
    let mut command = CommandSet::request(CommandType::CStoreRq, 1, sop_class_uids::CT_IMAGE_STORAGE).with_data_set();
    command.affected_sop_instance_uid = Some("1.2.826.0.1.3680043.2.1125.1.3".to_string());
    association.send(context_id, &command, Some(&dataset)).await.unwrap();

    let (response, _) = association.receive().await.unwrap();
    assert_eq!(response.command, CommandType::CStoreRsp);
    assert_eq!(response.status, Some(status::SUCCESS));
    association.release().await.unwrap();

    let path = data.path().join(
        "images/1.2.826.0.1.3680043.2.1125.1/1.2.826.0.1.3680043.2.1125.1.2/1.2.826.0.1.3680043.2.1125.1.3.dcm",
    );
    assert_eq!(tokio::fs::read(&path).await.unwrap(), dataset);

    manager.disconnect("modality-in").await.unwrap();
    assert!(connector.health_check(Duration::from_secs(1)).await.is_err());
    manager.shutdown().await;
}
