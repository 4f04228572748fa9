use crate::Error;

#[derive(Debug, thiserror::Error)]
pub enum PaymentGatewayError {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("payment gateway responded {0} after retries exhausted")]
    Upstream(reqwest::StatusCode),
}

#[derive(Debug, serde::Serialize)]
pub struct PaymentGatewayPostPaymentRequest {
    pub amount: i32,
}

const RETRY_COUNT: usize = 5;
const RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(100);

/// POSTs a payment to the external gateway, keyed by `ride_id` as an
/// idempotency key so retries never double-charge.
pub async fn request_payment_gateway_post_payment(
    client: &reqwest::Client,
    payment_gateway_url: &str,
    token: &str,
    ride_id: &str,
    param: &PaymentGatewayPostPaymentRequest,
) -> Result<(), Error> {
    let mut retry = 0;

    loop {
        let result = async {
            let res = client
                .post(format!("{payment_gateway_url}/payments"))
                .bearer_auth(token)
                .header("Idempotency-Key", ride_id)
                .json(param)
                .send()
                .await
                .map_err(PaymentGatewayError::Reqwest)?;

            if res.status() != reqwest::StatusCode::NO_CONTENT {
                return Err(PaymentGatewayError::Upstream(res.status()));
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => return Ok(()),
            Err(err) => {
                if retry >= RETRY_COUNT {
                    return Err(err.into());
                }
                retry += 1;
                tracing::warn!("pgw request failed: retrying [{retry}/{RETRY_COUNT}]: {err}");
                tokio::time::sleep(RETRY_SLEEP).await;
            }
        }
    }
}
