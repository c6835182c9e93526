//! 临床事件路由
//!
//! 将入站HL7消息归类为临床事件，交给持久化层保存并通知下游。
//! 路由失败只记录日志，不影响会话。

use async_trait::async_trait;
use pacs_core::{ClinicalEvent, ClinicalEventKind, ClinicalStore, Notification, Notifier};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::hl7::Hl7Message;

/// 临床事件路由器
#[derive(Clone)]
pub struct ClinicalEventRouter {
    store: Arc<dyn ClinicalStore>,
    notifier: Arc<dyn Notifier>,
}

impl ClinicalEventRouter {
    pub fn new(store: Arc<dyn ClinicalStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// 按消息类型归类；不关心的消息返回 `None`
    pub fn classify(message: &Hl7Message) -> Option<ClinicalEventKind> {
        match message.message_code() {
            "ADT" => Some(ClinicalEventKind::PatientUpdate),
            "ORM" | "OMG" => {
                let control = message.segment("ORC").map(|orc| orc.field(1).trim()).unwrap_or("");
                if control == "NW" {
                    Some(ClinicalEventKind::NewOrder)
                } else {
                    Some(ClinicalEventKind::OrderUpdate)
                }
            }
            "ORU" => {
                let status = message.segment("OBR").map(|obr| obr.field(25).trim()).unwrap_or("");
                if status == "C" {
                    Some(ClinicalEventKind::ReportUpdate)
                } else {
                    Some(ClinicalEventKind::NewReport)
                }
            }
            "SIU" => Some(ClinicalEventKind::ScheduleChange),
            _ => None,
        }
    }

    fn payload(kind: ClinicalEventKind, message: &Hl7Message) -> serde_json::Value {
        let detail = match kind {
            ClinicalEventKind::NewOrder | ClinicalEventKind::OrderUpdate => {
                serde_json::to_value(message.order_info()).unwrap_or_default()
            }
            ClinicalEventKind::NewReport | ClinicalEventKind::ReportUpdate => {
                serde_json::to_value(message.report_info()).unwrap_or_default()
            }
            ClinicalEventKind::ScheduleChange => serde_json::to_value(message.schedule_info()).unwrap_or_default(),
            ClinicalEventKind::PatientUpdate => serde_json::Value::Null,
        };

        json!({
            "triggerEvent": message.trigger_event(),
            "sendingApplication": message.sending_application,
            "sendingFacility": message.sending_facility,
            "patient": message.patient_info(),
            "detail": detail,
        })
    }

    /// 构建事件但不保存
    pub fn build_event(endpoint_id: &str, message: &Hl7Message) -> Option<ClinicalEvent> {
        let kind = Self::classify(message)?;
        let event = ClinicalEvent::new(
            kind,
            message.patient_ref(),
            message.message_type.clone(),
            message.control_id.clone(),
            Self::payload(kind, message),
        )
        .with_source(endpoint_id);
        Some(event)
    }

    /// 保存并通知；返回已处理的事件
    pub async fn route(&self, endpoint_id: &str, message: &Hl7Message) -> Option<ClinicalEvent> {
        let Some(event) = Self::build_event(endpoint_id, message) else {
            debug!("忽略消息类型 {} (control_id={})", message.message_type, message.control_id);
            return None;
        };

        if let Err(e) = self.store.save_clinical_event(&event).await {
            error!(
                "保存临床事件失败 {} control_id={}: {}",
                event.kind, event.control_id, e
            );
            return None;
        }

        info!(
            "临床事件 {} 患者={} 来源={} control_id={}",
            event.kind, event.patient_ref, endpoint_id, event.control_id
        );
        self.notifier.notify(Notification::from(&event)).await;
        Some(event)
    }
}

/// 仅写日志的通知器
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) {
        if notification.patient_ref.is_empty() {
            warn!("通知 {} 缺少患者标识", notification.kind);
        }
        info!("通知: {} 患者={}", notification.kind, notification.patient_ref);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hl7::Hl7Segment;
    use pacs_core::{ImageMetadata, ObjectRef, PacsError, Result};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub events: Mutex<Vec<ClinicalEvent>>,
        pub images: Mutex<Vec<ImageMetadata>>,
        pub fail: bool,
        /// 每次保存前的等待，模拟慢存储
        pub delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl ClinicalStore for RecordingStore {
        async fn save_clinical_event(&self, event: &ClinicalEvent) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(PacsError::Storage("只读文件系统".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn save_image_object(&self, _data: &[u8], metadata: &ImageMetadata) -> Result<ObjectRef> {
            self.images.lock().unwrap().push(metadata.clone());
            Ok(ObjectRef(metadata.sop_instance_uid.clone().unwrap_or_default()))
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub notifications: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }
    }

    fn orm(control: &str) -> Hl7Message {
        Hl7Message::new("ORM^O01", "RIS100")
            .with_segment(Hl7Segment::from_fields("PID", &["1", "", "PAT12345^^^HOSP^MR", "", "DOE^JANE"]))
            .with_segment(Hl7Segment::from_fields("ORC", &[control, "ORD001"]))
            .with_segment(Hl7Segment::from_fields("OBR", &["1", "ORD001", "", "71020^CHEST XRAY"]))
    }

    fn oru(status: &str) -> Hl7Message {
        let mut fields = vec![""; 25];
        fields[0] = "1";
        fields[1] = "ORD001";
        fields[24] = status;
        Hl7Message::new("ORU^R01", "RIS200")
            .with_segment(Hl7Segment::from_fields("PID", &["1", "", "PAT12345"]))
            .with_segment(Hl7Segment::from_fields("OBR", &fields))
    }

    #[test]
    fn test_classification_rules() {
        assert_eq!(ClinicalEventRouter::classify(&orm("NW")), Some(ClinicalEventKind::NewOrder));
        assert_eq!(ClinicalEventRouter::classify(&orm("XO")), Some(ClinicalEventKind::OrderUpdate));
        assert_eq!(ClinicalEventRouter::classify(&oru("F")), Some(ClinicalEventKind::NewReport));
        assert_eq!(ClinicalEventRouter::classify(&oru("C")), Some(ClinicalEventKind::ReportUpdate));
        assert_eq!(
            ClinicalEventRouter::classify(&Hl7Message::new("ADT^A08", "1")),
            Some(ClinicalEventKind::PatientUpdate)
        );
        assert_eq!(
            ClinicalEventRouter::classify(&Hl7Message::new("SIU^S12", "1")),
            Some(ClinicalEventKind::ScheduleChange)
        );
        assert_eq!(ClinicalEventRouter::classify(&Hl7Message::new("MFN^M02", "1")), None);
    }

    #[tokio::test]
    async fn test_route_saves_and_notifies() {
        let store = Arc::new(RecordingStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let router = ClinicalEventRouter::new(store.clone(), notifier.clone());

        let event = router.route("ris-main", &orm("NW")).await.unwrap();
        assert_eq!(event.kind, ClinicalEventKind::NewOrder);
        assert_eq!(event.patient_ref, "PAT12345");
        assert_eq!(event.source_endpoint, "ris-main");
        assert_eq!(event.payload["detail"]["placer_order_number"], "ORD001");
        assert_eq!(event.payload["patient"]["patient_name"], "DOE JANE");

        assert_eq!(store.events.lock().unwrap().len(), 1);
        let notifications = notifier.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, ClinicalEventKind::NewOrder);
    }

    #[tokio::test]
    async fn test_store_failure_skips_notification() {
        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let router = ClinicalEventRouter::new(store, notifier.clone());

        assert!(router.route("ris-main", &oru("F")).await.is_none());
        assert!(notifier.notifications.lock().unwrap().is_empty());
    }
}
