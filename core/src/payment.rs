use async_trait::async_trait;
use js_sys::{Object, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use crate::auction::AuctionView;
use crate::dm::{DmPayload, MessageType, PaymentOption};
use crate::error::{CoreError, Result};
use crate::MarketHandle;

/// Lightning支払いプロバイダ抽象（WebLN）
#[async_trait(?Send)]
pub trait LightningProvider {
    /// プロバイダ有効化。他の呼び出しの前提
    async fn enable(&self) -> Result<()>;

    /// インボイス生成。BOLT11文字列を返す
    async fn make_invoice(&self, amount: u64, memo: &str) -> Result<String>;

    /// 支払い送信。preimageを返す
    async fn send_payment(&self, invoice: &str) -> Result<String>;
}

/// window.webln 実装
pub struct WeblnProvider;

impl WeblnProvider {
    /// WebLNが利用可能か
    pub fn is_available() -> bool {
        if let Some(window) = web_sys::window() {
            if let Ok(webln) = Reflect::get(&window, &JsValue::from_str("webln")) {
                return !webln.is_undefined();
            }
        }
        false
    }

    /// window.weblnオブジェクトを取得
    fn get_webln() -> Result<Object> {
        let window =
            web_sys::window().ok_or_else(|| CoreError::Other("No window object".to_string()))?;
        let webln = Reflect::get(&window, &JsValue::from_str("webln"))?;

        if webln.is_undefined() {
            return Err(CoreError::CapabilityMissing(
                "window.webln is not available".to_string(),
            ));
        }

        Ok(webln.into())
    }

    /// メソッド呼び出し
    async fn call_method(method: &str, args: &[JsValue]) -> Result<JsValue> {
        let webln = Self::get_webln()?;
        let func = Reflect::get(&webln, &JsValue::from_str(method))?;

        let func = func.unchecked_ref::<js_sys::Function>();

        let promise = match args.len() {
            0 => func.call0(&webln)?,
            1 => func.call1(&webln, &args[0])?,
            _ => return Err(CoreError::Other("Too many arguments".to_string())),
        };

        let result = JsFuture::from(js_sys::Promise::from(promise))
            .await
            .map_err(|e| CoreError::PaymentError(format!("{:?}", e)))?;
        Ok(result)
    }
}

#[async_trait(?Send)]
impl LightningProvider for WeblnProvider {
    async fn enable(&self) -> Result<()> {
        Self::call_method("enable", &[]).await?;
        Ok(())
    }

    async fn make_invoice(&self, amount: u64, memo: &str) -> Result<String> {
        let args = Object::new();
        Reflect::set(&args, &"amount".into(), &JsValue::from_f64(amount as f64))?;
        Reflect::set(&args, &"defaultMemo".into(), &JsValue::from_str(memo))?;

        let result = Self::call_method("makeInvoice", &[args.into()]).await?;
        let invoice = Reflect::get(&result, &JsValue::from_str("paymentRequest"))?;
        invoice
            .as_string()
            .ok_or_else(|| CoreError::PaymentError("paymentRequest is not a string".to_string()))
    }

    async fn send_payment(&self, invoice: &str) -> Result<String> {
        let result = Self::call_method("sendPayment", &[JsValue::from_str(invoice)]).await?;
        let preimage = Reflect::get(&result, &JsValue::from_str("preimage"))?;
        preimage
            .as_string()
            .ok_or_else(|| CoreError::PaymentError("preimage is not a string".to_string()))
    }
}


/// 支払いフローの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Form,
    Invoice,
    Sending,
    Sent,
}

/// 落札者への支払い要求フロー
///
/// form → invoice → sending → sent の一方向で、ダイアログ毎に1インスタンス。
/// 送信失敗はinvoiceへ戻し、生成済みインボイスを保持して再送を安価にする
pub struct PaymentFlow {
    state: FlowState,
    amount: u64,
    memo: String,
    invoice: Option<String>,
}

impl PaymentFlow {
    pub fn new() -> Self {
        Self {
            state: FlowState::Form,
            amount: 0,
            memo: String::new(),
            invoice: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn invoice(&self) -> Option<&str> {
        self.invoice.as_deref()
    }

    pub fn set_amount(&mut self, amount: u64) {
        self.amount = amount;
    }

    pub fn set_memo(&mut self, memo: &str) {
        self.memo = memo.to_string();
    }

    /// form → invoice
    ///
    /// プロバイダ失敗時はformに留まり、エラーをそのまま返す
    pub async fn create_invoice(&mut self, provider: &dyn LightningProvider) -> Result<()> {
        if self.state != FlowState::Form {
            return Err(CoreError::Validation("invoice already generated".to_string()));
        }
        if self.amount == 0 {
            return Err(CoreError::Validation("amount must be positive".to_string()));
        }
        if self.memo.trim().is_empty() {
            return Err(CoreError::Validation("description is required".to_string()));
        }

        provider.enable().await?;
        let invoice = provider.make_invoice(self.amount, &self.memo).await?;

        self.invoice = Some(invoice);
        self.state = FlowState::Invoice;
        Ok(())
    }

    /// invoice → sending → sent
    ///
    /// 暗号化能力の欠如はネットワーク呼び出しの前に弾く
    pub async fn send_request(
        &mut self,
        handle: &MarketHandle,
        winner: &str,
        view: &AuctionView,
    ) -> Result<String> {
        if self.state != FlowState::Invoice {
            return Err(CoreError::Validation("no invoice ready to send".to_string()));
        }
        let invoice = match self.invoice.clone() {
            Some(invoice) => invoice,
            None => return Err(CoreError::Validation("no invoice generated".to_string())),
        };
        handle.identity()?;

        self.state = FlowState::Sending;
        let payload = payment_request_payload(view, self.amount, &self.memo, invoice)?;
        match handle.send_dm(winner, &payload).await {
            Ok(event_id) => {
                self.state = FlowState::Sent;
                Ok(event_id)
            }
            Err(e) => {
                // インボイスは保持したまま再送可能にする
                self.state = FlowState::Invoice;
                Err(e)
            }
        }
    }

    /// 入力を消してformへ戻す
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for PaymentFlow {
    fn default() -> Self {
        Self::new()
    }
}

fn payment_request_payload(
    view: &AuctionView,
    amount: u64,
    memo: &str,
    invoice: String,
) -> Result<DmPayload> {
    let mut payload = DmPayload::new(MessageType::PaymentRequest, memo)?.for_auction(view);
    payload.bid_amount = Some(amount);
    payload.paid = Some(false);
    payload.shipped = Some(false);
    payload.payment_options = Some(vec![PaymentOption {
        kind: "ln".to_string(),
        link: invoice,
    }]);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auction::reconcile;
    use crate::signer::internal::InternalSigner;
    use crate::store::mock::MockEventStore;
    use crate::types::{NostrEvent, KIND_AUCTION, KIND_DM};
    use serde_json::json;

    struct MockProvider {
        fail: bool,
    }

    #[async_trait(?Send)]
    impl LightningProvider for MockProvider {
        async fn enable(&self) -> Result<()> {
            Ok(())
        }

        async fn make_invoice(&self, amount: u64, _memo: &str) -> Result<String> {
            if self.fail {
                return Err(CoreError::PaymentError("node offline".to_string()));
            }
            Ok(format!("lnbc{}n1mock", amount))
        }

        async fn send_payment(&self, _invoice: &str) -> Result<String> {
            Ok("preimage".to_string())
        }
    }

    fn view(seller: &str) -> AuctionView {
        let listing = NostrEvent {
            id: "ev1".to_string(),
            pubkey: seller.to_string(),
            kind: KIND_AUCTION,
            content: json!({
                "id": "a1",
                "title": "Sunset",
                "images": ["https://example.com/a.png"],
                "starting_bid": 1000,
                "start_date": 1000,
                "duration": 3600,
                "shipping": { "local": { "cost": 0 }, "international": { "cost": 0 } }
            })
            .to_string(),
            tags: vec![vec!["d".to_string(), "a1".to_string()]],
            created_at: 100,
            sig: String::new(),
        };
        reconcile(&[listing], &[], &[], &[], 2000).remove(0)
    }

    async fn handle_with_signer(store: &MockEventStore) -> MarketHandle {
        let mut handle = MarketHandle::new(Arc::new(store.clone()));
        handle
            .set_signer(Arc::new(InternalSigner::generate()))
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn test_create_invoice_requires_valid_form() {
        let provider = MockProvider { fail: false };
        let mut flow = PaymentFlow::new();

        flow.set_memo("Sunset final price");
        let err = flow.create_invoice(&provider).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(flow.state(), FlowState::Form);

        flow.set_amount(1500);
        flow.set_memo("  ");
        let err = flow.create_invoice(&provider).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(flow.state(), FlowState::Form);
    }

    #[tokio::test]
    async fn test_provider_failure_stays_in_form() {
        let provider = MockProvider { fail: true };
        let mut flow = PaymentFlow::new();
        flow.set_amount(1500);
        flow.set_memo("Sunset final price");

        let err = flow.create_invoice(&provider).await.unwrap_err();
        assert!(matches!(err, CoreError::PaymentError(_)));
        assert_eq!(flow.state(), FlowState::Form);
        assert!(flow.invoice().is_none());
    }

    #[tokio::test]
    async fn test_send_requires_invoice_and_identity() {
        let store = MockEventStore::new();
        let handle = handle_with_signer(&store).await;
        let seller = handle.pubkey().unwrap().to_string();
        let view = view(&seller);

        let mut flow = PaymentFlow::new();
        let err = flow.send_request(&handle, "winner", &view).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        // Signerが無ければネットワークに触れる前に失敗
        let no_signer = MarketHandle::new(Arc::new(store.clone()));
        flow.set_amount(1500);
        flow.set_memo("Sunset final price");
        flow.create_invoice(&MockProvider { fail: false }).await.unwrap();
        let err = flow.send_request(&no_signer, "winner", &view).await.unwrap_err();
        assert!(matches!(err, CoreError::CapabilityMissing(_)));
        assert_eq!(flow.state(), FlowState::Invoice);
    }

    #[tokio::test]
    async fn test_send_failure_rolls_back_to_invoice() {
        let store = MockEventStore::new();
        let handle = handle_with_signer(&store).await;
        let seller = handle.pubkey().unwrap().to_string();
        let view = view(&seller);
        let winner = InternalSigner::generate();
        let winner_pub = {
            use crate::signer::Signer;
            winner.get_public_key().await.unwrap()
        };

        let mut flow = PaymentFlow::new();
        flow.set_amount(1500);
        flow.set_memo("Sunset final price");
        flow.create_invoice(&MockProvider { fail: false }).await.unwrap();
        let invoice = flow.invoice().unwrap().to_string();

        store.set_unavailable(true);
        let err = flow.send_request(&handle, &winner_pub, &view).await.unwrap_err();
        assert!(matches!(err, CoreError::PublishError(_)));
        assert_eq!(flow.state(), FlowState::Invoice);
        assert_eq!(flow.invoice(), Some(invoice.as_str()));

        // 再送は生成済みインボイスのまま成功する
        store.set_unavailable(false);
        flow.send_request(&handle, &winner_pub, &view).await.unwrap();
        assert_eq!(flow.state(), FlowState::Sent);
    }

    #[tokio::test]
    async fn test_full_flow_publishes_payment_request() {
        let store = MockEventStore::new();
        let handle = handle_with_signer(&store).await;
        let seller = handle.pubkey().unwrap().to_string();
        let view = view(&seller);
        let winner = InternalSigner::generate();
        let winner_pub = {
            use crate::signer::Signer;
            winner.get_public_key().await.unwrap()
        };

        let mut flow = PaymentFlow::new();
        flow.set_amount(1500);
        flow.set_memo("Sunset final price");
        flow.create_invoice(&MockProvider { fail: false }).await.unwrap();
        assert_eq!(flow.invoice(), Some("lnbc1500n1mock"));

        flow.send_request(&handle, &winner_pub, &view).await.unwrap();
        assert_eq!(flow.state(), FlowState::Sent);

        let published = store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, KIND_DM);

        // 落札者は支払いオプション付きのペイロードを復号できる
        use crate::signer::Signer;
        let plaintext = winner
            .nip04_decrypt(&seller, &published[0].content)
            .await
            .unwrap();
        let payload: DmPayload = serde_json::from_str(&plaintext).unwrap();
        assert_eq!(payload.message_type, MessageType::PaymentRequest.code());
        assert_eq!(payload.paid, Some(false));
        assert_eq!(payload.shipped, Some(false));
        assert_eq!(payload.auction_id.as_deref(), Some("a1"));
        let options = payload.payment_options.unwrap();
        assert_eq!(options[0].kind, "ln");
        assert_eq!(options[0].link, "lnbc1500n1mock");

        flow.reset();
        assert_eq!(flow.state(), FlowState::Form);
        assert!(flow.invoice().is_none());
    }
}
