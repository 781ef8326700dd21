use std::fmt;

/// 处理阶段标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 第一阶段：视觉模型（OCR + 书写质量评分）
    Vlm,
    /// 第二阶段：语言模型（批改报告生成）
    Llm,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Vlm => write!(f, "VLM"),
            Stage::Llm => write!(f, "LLM"),
        }
    }
}

/// 应用程序错误类型
#[derive(Debug)]
pub enum AppError {
    /// 配置错误
    Config(ConfigError),
    /// 外部服务调用错误
    Service(ServiceError),
    /// 持久化错误（报告、配置文件、目录）
    Persistence(PersistenceError),
    /// 运行（批次）管理错误
    Run(RunError),
    /// 其他错误（用于包装第三方库错误）
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "配置错误: {}", e),
            AppError::Service(e) => write!(f, "服务错误: {}", e),
            AppError::Persistence(e) => write!(f, "持久化错误: {}", e),
            AppError::Run(e) => write!(f, "运行错误: {}", e),
            AppError::Other(msg) => write!(f, "错误: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(e) => Some(e),
            AppError::Service(e) => Some(e),
            AppError::Persistence(e) => Some(e),
            AppError::Run(e) => Some(e),
            AppError::Other(_) => None,
        }
    }
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 必需的配置项缺失（阻止提交批次）
    MissingKey {
        key: String,
        label: String,
    },
    /// 配置文件或密文损坏（降级为空值，不会中断启动）
    Corrupt {
        path: String,
        detail: String,
    },
    /// 敏感项加密失败
    EncryptFailed {
        key: String,
    },
    /// 配置值校验失败
    InvalidValue {
        key: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingKey { key, label } => {
                write!(f, "缺少必需配置项 {} ({})", key, label)
            }
            ConfigError::Corrupt { path, detail } => {
                write!(f, "配置数据损坏 ({}): {}", path, detail)
            }
            ConfigError::EncryptFailed { key } => {
                write!(f, "敏感配置项 {} 加密失败", key)
            }
            ConfigError::InvalidValue { key, reason } => {
                write!(f, "配置项 {} 的值无效: {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// 外部服务调用错误
///
/// 分类决定重试行为：瞬时错误按配置重试，永久错误立即失败。
#[derive(Debug)]
pub enum ServiceError {
    /// 瞬时错误（超时、网络、5xx 类），可重试
    Transient {
        stage: Stage,
        detail: String,
    },
    /// 永久错误（响应格式不符、校验失败），不重试
    Permanent {
        stage: Stage,
        detail: String,
    },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Transient { stage, detail } => {
                write!(f, "{} 调用瞬时失败: {}", stage, detail)
            }
            ServiceError::Permanent { stage, detail } => {
                write!(f, "{} 调用永久失败: {}", stage, detail)
            }
        }
    }
}

impl std::error::Error for ServiceError {}

/// 持久化错误
#[derive(Debug)]
pub enum PersistenceError {
    /// 写入文件失败
    WriteFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 复制输入文件失败
    CopyFailed {
        from: String,
        to: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 创建目录失败
    DirCreateFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 序列化失败
    SerializeFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::WriteFailed { path, source } => {
                write!(f, "写入文件失败 ({}): {}", path, source)
            }
            PersistenceError::CopyFailed { from, to, source } => {
                write!(f, "复制文件失败 ({} -> {}): {}", from, to, source)
            }
            PersistenceError::DirCreateFailed { path, source } => {
                write!(f, "创建目录失败 ({}): {}", path, source)
            }
            PersistenceError::SerializeFailed { source } => {
                write!(f, "序列化失败: {}", source)
            }
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistenceError::WriteFailed { source, .. }
            | PersistenceError::CopyFailed { source, .. }
            | PersistenceError::DirCreateFailed { source, .. }
            | PersistenceError::SerializeFailed { source } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
        }
    }
}

/// 运行（批次）管理错误
#[derive(Debug)]
pub enum RunError {
    /// 指定的运行不存在
    NotFound {
        run_id: String,
    },
    /// 输入文件不存在
    InputNotFound {
        path: String,
    },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::NotFound { run_id } => write!(f, "运行 {} 不存在", run_id),
            RunError::InputNotFound { path } => write!(f, "输入文件不存在: {}", path),
        }
    }
}

impl std::error::Error for RunError {}

// ========== 从常见错误类型转换 ==========
// 注意：不需要手动实现 From<AppError> for anyhow::Error，
// 因为 anyhow 已经为所有实现了 std::error::Error 的类型提供了自动实现

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Persistence(PersistenceError::SerializeFailed {
            source: Box::new(err),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建必需配置项缺失错误
    pub fn config_missing(key: impl Into<String>, label: impl Into<String>) -> Self {
        AppError::Config(ConfigError::MissingKey {
            key: key.into(),
            label: label.into(),
        })
    }

    /// 创建配置值校验错误
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        })
    }

    /// 创建瞬时服务错误（可重试）
    pub fn transient(stage: Stage, detail: impl Into<String>) -> Self {
        AppError::Service(ServiceError::Transient {
            stage,
            detail: detail.into(),
        })
    }

    /// 创建永久服务错误（不重试）
    pub fn permanent(stage: Stage, detail: impl Into<String>) -> Self {
        AppError::Service(ServiceError::Permanent {
            stage,
            detail: detail.into(),
        })
    }

    /// 创建文件写入错误
    pub fn write_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Persistence(PersistenceError::WriteFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建运行不存在错误
    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        AppError::Run(RunError::NotFound {
            run_id: run_id.into(),
        })
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Service(ServiceError::Transient { .. }))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
