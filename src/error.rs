// 错误类型定义
//
// 使用 thiserror 库定义结构化错误类型，确保所有错误都能被正确处理。
// 非测试代码绝不使用 panic! 或 .unwrap()，所有操作都返回 Result 类型。

use thiserror::Error;

/// Agent 错误类型
#[derive(Error, Debug)]
pub enum AgentError {
    /// 启动配置错误（缺少混淆表、缺少 HMAC 密钥等）—— 致命
    #[error("Configuration error: {0}")]
    Config(String),

    /// 连接/传输错误（socket、TLS、HTTP 非 2xx）—— 可重试
    #[error("Connection error: {0}")]
    Connection(String),

    /// 帧协议错误（长度前缀、HMAC 校验、AEAD 解密）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 状态加密错误（主密钥派生、信封加解密）
    #[error("State encryption error: {0}")]
    State(String),

    /// 命令执行错误
    #[error("Command execution error: {0}")]
    Execution(String),

    /// 动态模块错误（加载、握手、RPC 调用）
    #[error("Module error: {0}")]
    Module(String),

    /// 消息序列化/反序列化错误
    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP 客户端错误
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result 类型别名，简化错误处理
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::Connection("refused".to_string());
        assert_eq!(err.to_string(), "Connection error: refused");

        let err = AgentError::Protocol("hmac verification failed".to_string());
        assert!(err.to_string().contains("hmac verification failed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: AgentError = io_err.into();
        assert!(matches!(err, AgentError::Io(_)));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: AgentError = parse_err.into();
        assert!(matches!(err, AgentError::Serialization(_)));
    }
}
