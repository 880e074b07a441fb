const KELVIN_OFFSET: f64 = 273.15;

pub fn kelvin_to_celsius(kelvin: f64) -> f64 {
    kelvin - KELVIN_OFFSET
}

pub fn kelvin_to_fahrenheit(kelvin: f64) -> f64 {
    (kelvin - KELVIN_OFFSET) * 9.0 / 5.0 + 32.0
}

pub fn celsius_to_kelvin(celsius: f64) -> f64 {
    celsius + KELVIN_OFFSET
}

pub fn fahrenheit_to_kelvin(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0 + KELVIN_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_freezing_point() {
        assert!(kelvin_to_celsius(273.15).abs() < EPS);
        assert!((kelvin_to_fahrenheit(273.15) - 32.0).abs() < EPS);
    }

    #[test]
    fn test_boiling_point() {
        assert!((kelvin_to_celsius(373.15) - 100.0).abs() < EPS);
        assert!((kelvin_to_fahrenheit(373.15) - 212.0).abs() < EPS);
    }

    #[test]
    fn test_fahrenheit_round_trip() {
        for f in [-40.0, 0.0, 32.0, 71.6, 104.0] {
            let k = fahrenheit_to_kelvin(f);
            assert!((kelvin_to_fahrenheit(k) - f).abs() < EPS, "{}", f);
        }
        // -40 is the same on both scales
        assert!((kelvin_to_celsius(fahrenheit_to_kelvin(-40.0)) + 40.0).abs() < EPS);
    }

    #[test]
    fn test_celsius_round_trip() {
        for c in [-30.5, 0.0, 21.3] {
            assert!((kelvin_to_celsius(celsius_to_kelvin(c)) - c).abs() < EPS);
        }
    }
}
