//! Expected consumer wait time of a bounded buffer.
//!
//! An asynchronous operator is modelled as a producer and a consumer
//! connected by a buffer of `n` slots. With `x` the consumer's time between
//! requests, `y` the producer's time per element and `p` the probability
//! that the consumer finds the buffer empty:
//!
//! ```text
//! y = 0   ->  p = 0
//! x = 0   ->  p = 1
//! x = y   ->  p = 1 / (n + 1)
//! else    ->  p = (1 - x/y) / (1 - (x/y)^(n+1))
//! ```
//!
//! and the expected wait is `T = p * y`. Alongside `T` this module returns
//! the partial derivatives `dT/dy`, `dT/dx` and `dT/dn` used by gradient
//! descent. On the boundary lines the derivatives are the one-sided limits,
//! not the derivative of the constant boundary value.

/// Wait time together with its partial derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WaitTime {
    /// Expected wait per element, in the unit of the inputs
    pub wait: f64,
    /// d(wait) / d(producer_time)
    pub d_producer: f64,
    /// d(wait) / d(consumer_time)
    pub d_consumer: f64,
    /// d(wait) / d(buffer_size)
    pub d_buffer: f64,
}

#[inline]
fn square(x: f64) -> f64 {
    x * x
}

/// Expected time a consumer waits on a buffer of `buffer_size` slots.
pub fn compute_wait_time(producer_time: f64, consumer_time: f64, buffer_size: f64) -> WaitTime {
    // Producer infinitely fast: the buffer is always full.
    if producer_time == 0.0 {
        let d_producer = if buffer_size == 0.0 || consumer_time == 0.0 {
            1.0
        } else {
            0.0
        };
        return WaitTime {
            wait: 0.0,
            d_producer,
            d_consumer: 0.0,
            d_buffer: 0.0,
        };
    }

    // Consumer infinitely fast: every element is waited for in full.
    if consumer_time == 0.0 {
        return WaitTime {
            wait: producer_time,
            d_producer: 1.0,
            d_consumer: if buffer_size == 0.0 { 0.0 } else { -1.0 },
            d_buffer: 0.0,
        };
    }

    if consumer_time > producer_time {
        let ratio = producer_time / consumer_time;
        if ratio < 1.0 {
            return slow_consumer(producer_time, ratio, buffer_size);
        }
    } else if consumer_time < producer_time {
        let ratio = consumer_time / producer_time;
        if ratio < 1.0 {
            return slow_producer(producer_time, ratio, buffer_size);
        }
    }

    // Equal rates, or rates too close for the ratio to be told apart from 1.
    let p_empty = 1.0 / (buffer_size + 1.0);
    let p_empty_der = -buffer_size / (2.0 * buffer_size + 2.0);
    WaitTime {
        wait: p_empty * producer_time,
        d_producer: p_empty - p_empty_der,
        d_consumer: p_empty_der,
        d_buffer: -producer_time / square(buffer_size + 1.0),
    }
}

/// Consumer slower than producer; `ratio = y / x < 1`.
fn slow_consumer(producer_time: f64, ratio: f64, buffer_size: f64) -> WaitTime {
    let ratio_pow = ratio.powf(buffer_size);
    let denom = 1.0 - ratio * ratio_pow;
    let p_empty = ratio_pow * (1.0 - ratio) / denom;
    let p_empty_der = (buffer_size - (buffer_size + 1.0) * ratio + ratio_pow * ratio) * ratio_pow
        / ratio
        / square(denom);
    WaitTime {
        wait: p_empty * producer_time,
        d_producer: p_empty + p_empty_der * ratio,
        d_consumer: -p_empty_der * square(ratio),
        d_buffer: p_empty / denom * ratio.ln() * producer_time,
    }
}

/// Producer slower than consumer; `ratio = x / y < 1`.
fn slow_producer(producer_time: f64, ratio: f64, buffer_size: f64) -> WaitTime {
    let ratio_pow = ratio.powf(buffer_size);
    let denom = 1.0 - ratio_pow * ratio;
    let p_empty = (1.0 - ratio) / denom;
    let p_empty_der =
        ((buffer_size + 1.0 - buffer_size * ratio) * ratio_pow - 1.0) / square(denom);
    WaitTime {
        wait: p_empty * producer_time,
        d_producer: p_empty - p_empty_der * ratio,
        d_consumer: p_empty_der,
        d_buffer: p_empty / denom * ratio_pow * ratio * ratio.ln() * producer_time,
    }
}
