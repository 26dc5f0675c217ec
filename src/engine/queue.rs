//! 任务队列
//!
//! 多生产者多消费者的 FIFO 队列。pop 在队列为空时挂起，
//! 直到有新任务或队列关闭；关闭后先把剩余任务发完再报告结束。
//! idle_workers 统计当前阻塞在 pop 中的工作协程数，供窃取者参考

use std::collections::VecDeque;
use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::task::Task;

#[derive(Debug, Default)]
struct Inner {
    tasks: VecDeque<Task>,
    closed: bool,
    idle: usize,
}

/// 字节区间任务队列
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队单个任务
    pub fn push(&self, task: Task) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.tasks.push_back(task);
        }
        self.notify.notify_one();
    }

    /// 批量入队
    pub fn push_many(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut count = 0;
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            for task in tasks {
                inner.tasks.push_back(task);
                count += 1;
            }
        }
        for _ in 0..count {
            self.notify.notify_one();
        }
    }

    /// 取出下一个任务
    ///
    /// 队列为空时挂起；关闭且排空后返回 None
    pub async fn pop(&self) -> Option<Task> {
        let mut notified = pin!(self.notify.notified());
        loop {
            // 先注册唤醒意向再检查队列，避免丢失通知
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(task) = inner.tasks.pop_front() {
                    // 队列还有剩余时链式唤醒下一个等待者
                    if !inner.tasks.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(task);
                }
                if inner.closed {
                    return None;
                }
                inner.idle += 1;
            }

            notified.as_mut().await;

            self.inner.lock().idle -= 1;
            notified.set(self.notify.notified());
        }
    }

    /// 当前排队任务数
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前阻塞在 pop 中的工作协程数
    pub fn idle_workers(&self) -> usize {
        self.inner.lock().idle
    }

    /// 关闭队列；已入队的任务仍会被 pop 取走
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// 关闭后取出所有未被处理的任务（用于持久化残留区间）
    pub fn drain_remaining(&self) -> Vec<Task> {
        let mut inner = self.inner.lock();
        inner.tasks.drain(..).collect()
    }

    /// 当前排队任务的快照（定期保存状态用，不改变队列）
    pub fn snapshot(&self) -> Vec<Task> {
        self.inner.lock().tasks.iter().copied().collect()
    }
}
